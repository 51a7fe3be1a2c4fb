//! Store - the local-first state container.
//!
//! The Store holds the optimistic view of a collection: last-known server
//! data overlaid with every local change the server has not confirmed yet.
//! Mutations apply to that view immediately and are handed to the
//! [`ChangeQueue`] for background sync; fetches replace the server baseline
//! without discarding unconfirmed local edits.

use crate::cache::ReadCache;
use crate::config::StoreConfig;
use crate::identity::{IdentityCache, RecordHandle};
use crate::queue::{BatchOutcome, ChangeQueue, ItemStatus, QueueEvent, QueueState};
use crate::record::Slot;
use crate::snapshot::{FetchStatus, StoreState, SyncState};
use crate::subscription::{Listeners, Subscription};
use crate::{
    CancelToken, Change, ChangeKind, Error, FetchResponse, FetchTransport, Record, RecordId,
    SyncTransport, Version,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Query parameters a store fetches for.
///
/// Serialized to JSON to form read cache keys.
pub trait Context: Clone + Serialize + Debug + Send + Sync + 'static {}

impl<T: Clone + Serialize + Debug + Send + Sync + 'static> Context for T {}

struct Core<R, C> {
    state: Arc<StoreState<R, C>>,
    /// Last-known server data
    server: HashMap<RecordId, Arc<R>>,
    cache: ReadCache<FetchResponse<R>>,
    identity: IdentityCache<R>,
    fetch_token: Option<CancelToken>,
    /// Bumped whenever the read cache is cleared for a local or confirmed
    /// change, so fetches that started earlier don't repopulate it.
    cache_generation: u64,
    next_version: Version,
    batch_depth: usize,
    dirty: bool,
}

impl<R: Clone, C> Core<R, C> {
    fn bump(&mut self) -> Version {
        self.next_version += 1;
        self.next_version
    }

    fn invalidate_cache(&mut self) {
        self.cache.invalidate();
        self.cache_generation += 1;
    }
}

struct StoreInner<R: Record, C: Context> {
    config: StoreConfig,
    queue: ChangeQueue<R>,
    fetcher: Arc<dyn FetchTransport<R, C>>,
    core: Mutex<Core<R, C>>,
    listeners: Listeners<Arc<StoreState<R, C>>>,
    queue_subscription: Mutex<Option<Subscription>>,
}

/// Optimistic, subscribable mirror of one server collection.
///
/// Cloning yields another handle to the same store. Mutations must be
/// called inside a Tokio runtime since they arm the queue's debounce timer.
pub struct Store<R: Record, C: Context> {
    inner: Arc<StoreInner<R, C>>,
}

impl<R: Record, C: Context> Clone for Store<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record, C: Context> Store<R, C> {
    /// Create a store with an empty baseline for `context`. Call
    /// [`Store::refresh`] to load server data.
    pub fn new(
        config: StoreConfig,
        context: C,
        fetcher: Arc<dyn FetchTransport<R, C>>,
        syncer: Arc<dyn SyncTransport<R>>,
    ) -> Self {
        let queue = ChangeQueue::new(config.queue.clone(), syncer);
        let core = Core {
            state: Arc::new(StoreState::new(context)),
            server: HashMap::new(),
            cache: ReadCache::from_config(&config.cache),
            identity: IdentityCache::new(),
            fetch_token: None,
            cache_generation: 0,
            next_version: 0,
            batch_depth: 0,
            dirty: false,
        };
        let inner = Arc::new(StoreInner {
            config,
            queue,
            fetcher,
            core: Mutex::new(core),
            listeners: Listeners::new(),
            queue_subscription: Mutex::new(None),
        });

        let store = Arc::downgrade(&inner);
        let subscription = inner.queue.subscribe(move |event| {
            if let Some(inner) = store.upgrade() {
                Store { inner }.on_queue_event(event);
            }
        });
        *inner.queue_subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The store's change queue.
    pub fn queue(&self) -> &ChangeQueue<R> {
        &self.inner.queue
    }

    /// Current state snapshot.
    pub fn get_state(&self) -> Arc<StoreState<R, C>> {
        Arc::clone(&self.inner.core.lock().state)
    }

    /// Current queue snapshot.
    pub fn queue_state(&self) -> Arc<QueueState<R>> {
        self.inner.queue.snapshot()
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<Arc<R>> {
        let core = self.inner.core.lock();
        core.state.items.get(id).map(|slot| Arc::clone(&slot.value))
    }

    /// Stable handle for a record; equal across calls until it changes.
    pub fn handle(&self, id: &str) -> Option<RecordHandle<R>> {
        let mut core = self.inner.core.lock();
        let state = Arc::clone(&core.state);
        let slot = state.items.get(id)?;
        Some(core.identity.handle(id, slot))
    }

    /// Query the current records.
    pub fn query(&self) -> Query<R> {
        Query {
            items: Arc::clone(&self.get_state().items),
        }
    }

    /// Sync status of a record, derived from the queue. `None` means the
    /// record is fully synced (or unknown).
    pub fn get_item_status(&self, id: &str) -> Option<ItemStatus> {
        self.inner.queue.status(id)
    }

    /// Register a callback receiving every new state snapshot.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<StoreState<R, C>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.add(listener)
    }

    /// Create a record. An empty id is replaced by a temporary one.
    ///
    /// Returns the id the record is stored under.
    pub fn create(&self, mut record: R) -> RecordId {
        if record.id().is_empty() {
            record.set_id(format!("temp-{}", uuid::Uuid::new_v4()));
        }
        let id = record.id().to_string();
        let change = Change::create(record.clone());

        self.batch(|| {
            self.commit(|core, next| {
                let version = core.bump();
                Arc::make_mut(&mut next.items).insert(id.clone(), Slot::new(record, version));
                core.invalidate_cache();
                true
            });
            self.inner.queue.enqueue(change);
        });
        id
    }

    /// Update a record through a copy-and-patch closure. No-op if absent.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut R)) {
        let Some(current) = self.get(id) else {
            tracing::debug!(id, "update of unknown record ignored");
            return;
        };
        let mut draft = R::clone(&current);
        mutate(&mut draft);
        draft.set_id(id.to_string());
        let change = Change::update(draft.clone());

        self.batch(|| {
            self.commit(|core, next| {
                let version = core.bump();
                Arc::make_mut(&mut next.items).insert(id.to_string(), Slot::new(draft, version));
                core.invalidate_cache();
                true
            });
            self.inner.queue.enqueue(change);
        });
    }

    /// Remove a record. It disappears from reads immediately. No-op if absent.
    pub fn remove(&self, id: &str) {
        let Some(current) = self.get(id) else {
            tracing::debug!(id, "remove of unknown record ignored");
            return;
        };
        let change = Change::delete(R::clone(&current));

        self.batch(|| {
            self.commit(|core, next| {
                Arc::make_mut(&mut next.items).remove(id);
                core.invalidate_cache();
                true
            });
            self.inner.queue.enqueue(change);
        });
    }

    /// Run `f` with notifications suppressed, then notify once if anything
    /// changed. Batches nest.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        self.inner.core.lock().batch_depth += 1;
        let _guard = BatchGuard { store: self };
        f()
    }

    /// Switch to another context and load it, from the read cache when a
    /// fresh entry exists.
    pub async fn set_context(&self, context: C) {
        self.load(context, true).await;
    }

    /// Re-fetch the current context from the server.
    pub async fn refresh(&self) {
        let context = self.get_state().context.clone();
        self.load(context, false).await;
    }

    /// Suspend background sync.
    pub fn pause_sync(&self) {
        self.inner.queue.pause();
    }

    /// Resume background sync.
    pub fn resume_sync(&self) {
        self.inner.queue.resume();
    }

    /// Retry a record whose sync failed.
    pub fn retry(&self, id: &str) {
        self.inner.queue.retry(id);
    }

    /// Retry every failed record.
    pub fn retry_all(&self) {
        self.inner.queue.retry_all();
    }

    /// Tear the store down: stop syncing, cancel any fetch and drop all
    /// subscribers. Local state stays readable.
    pub fn destroy(&self) {
        if let Some(subscription) = self.inner.queue_subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.inner.queue.destroy();
        if let Some(token) = self.inner.core.lock().fetch_token.take() {
            token.cancel();
        }
        self.inner.listeners.clear();
        tracing::info!(collection = %self.inner.config.collection, "store destroyed");
    }

    async fn load(&self, context: C, use_cache: bool) {
        let collection = &self.inner.config.collection;
        let key = match serde_json::to_string(&context).map_err(Error::from) {
            Ok(params) => Some(ReadCache::<FetchResponse<R>>::key(collection, &params)),
            Err(err) => {
                tracing::warn!(%collection, error = %err, "context not serializable, read cache bypassed");
                None
            }
        };

        let token = CancelToken::new();
        let (cached, generation) = {
            let mut core = self.inner.core.lock();
            if let Some(previous) = core.fetch_token.replace(token.clone()) {
                previous.cancel();
            }
            let cached = match &key {
                Some(key) if use_cache => core.cache.get(key),
                _ => None,
            };
            (cached, core.cache_generation)
        };

        if let Some(response) = cached {
            tracing::debug!(%collection, "fetch served from read cache");
            self.apply_fetch(context, response);
            return;
        }

        self.commit(|_, next| {
            next.context = context.clone();
            next.loading = true;
            next.fetch_status = FetchStatus::Loading;
            next.sync_state = SyncState::Fetching;
            true
        });
        tracing::debug!(%collection, ?context, "fetching");

        let result = self.inner.fetcher.fetch(&context, token.clone()).await;
        if token.is_cancelled() {
            tracing::debug!(%collection, "fetch superseded");
            return;
        }

        match result {
            Ok(response) => {
                if let Some(key) = key {
                    let mut core = self.inner.core.lock();
                    if core.cache_generation == generation {
                        core.cache.put(key, response.clone());
                    } else {
                        tracing::debug!(%collection, "fetch overlapped a change, not cached");
                    }
                }
                self.apply_fetch(context, response);
            }
            Err(err) if err.is_cancelled() => {
                let syncing = self.inner.queue.snapshot().syncing;
                self.commit(|_, next| {
                    next.loading = false;
                    next.fetch_status = FetchStatus::Idle;
                    next.sync_state = sync_state(false, syncing);
                    true
                });
            }
            Err(err) => {
                tracing::warn!(%collection, error = %err, "fetch failed");
                let syncing = self.inner.queue.snapshot().syncing;
                self.commit(|_, next| {
                    next.loading = false;
                    next.fetch_status = FetchStatus::Error;
                    next.fetch_error = Some(err.to_string());
                    next.sync_state = sync_state(false, syncing);
                    true
                });
            }
        }
    }

    /// Install a fetch result as the new baseline and re-apply every
    /// unconfirmed local change on top of it.
    fn apply_fetch(&self, context: C, response: FetchResponse<R>) {
        let queue = self.inner.queue.snapshot();
        self.commit(|core, next| {
            core.server = response
                .items
                .into_iter()
                .map(|record| (record.id().to_string(), Arc::new(record)))
                .collect();

            let mut items = HashMap::with_capacity(core.server.len());
            for (id, value) in overlay(&core.server, &queue) {
                let slot = match next.items.get(&id) {
                    Some(slot) if *slot.value == *value => slot.clone(),
                    _ => Slot {
                        value,
                        version: core.bump(),
                    },
                };
                items.insert(id, slot);
            }

            next.items = Arc::new(items);
            next.context = context;
            next.loading = false;
            next.fetch_status = FetchStatus::Success;
            next.fetch_error = None;
            next.server_state = response.server_state;
            next.sync_state = sync_state(false, queue.syncing);
            true
        });
    }

    fn on_queue_event(&self, event: &QueueEvent<R>) {
        match event {
            QueueEvent::Changed(queue) => {
                self.commit(|_, next| {
                    next.sync_state = sync_state(next.loading, queue.syncing);
                    true
                });
            }
            QueueEvent::Settled(outcome) => self.settle(outcome),
        }
    }

    /// Apply id remaps and advance the server baseline after a batch.
    fn settle(&self, outcome: &BatchOutcome<R>) {
        self.commit(|core, next| {
            let items = Arc::make_mut(&mut next.items);
            for remap in &outcome.remaps {
                if let Some(slot) = items.remove(&remap.old_id) {
                    let value = slot.value.with_id(remap.new_id.clone());
                    items.insert(remap.new_id.clone(), Slot::new(value, core.bump()));
                }
                if let Some(value) = core.server.remove(&remap.old_id) {
                    let value = value.with_id(remap.new_id.clone());
                    core.server.insert(remap.new_id.clone(), Arc::new(value));
                }
                tracing::debug!(old_id = %remap.old_id, new_id = %remap.new_id, "record id remapped");
            }

            for change in &outcome.committed {
                match change.kind {
                    ChangeKind::Delete => {
                        core.server.remove(&change.id);
                    }
                    ChangeKind::Create | ChangeKind::Update => {
                        core.server
                            .insert(change.id.clone(), Arc::new(change.data.clone()));
                    }
                }
            }

            if !outcome.remaps.is_empty() || !outcome.committed.is_empty() {
                core.invalidate_cache();
            }
            next.sync_state = sync_state(next.loading, outcome.state.syncing);
            true
        });
    }

    /// Build the next state from the current one and swap it in. Nothing
    /// changes when `f` returns false.
    fn commit(&self, f: impl FnOnce(&mut Core<R, C>, &mut StoreState<R, C>) -> bool) {
        let notify = {
            let mut core = self.inner.core.lock();
            let mut next = StoreState::clone(&core.state);
            if !f(&mut *core, &mut next) {
                return;
            }
            core.identity.prune(&next.items);
            core.state = Arc::new(next);
            if core.batch_depth > 0 {
                core.dirty = true;
                false
            } else {
                true
            }
        };
        if notify {
            self.notify();
        }
    }

    fn notify(&self) {
        let state = self.get_state();
        self.inner.listeners.emit(&state);
    }
}

struct BatchGuard<'a, R: Record, C: Context> {
    store: &'a Store<R, C>,
}

impl<R: Record, C: Context> Drop for BatchGuard<'_, R, C> {
    fn drop(&mut self) {
        let notify = {
            let mut core = self.store.inner.core.lock();
            core.batch_depth -= 1;
            let notify = core.batch_depth == 0 && core.dirty;
            if notify {
                core.dirty = false;
            }
            notify
        };
        if notify && !std::thread::panicking() {
            self.store.notify();
        }
    }
}

fn sync_state(loading: bool, syncing: bool) -> SyncState {
    if loading {
        SyncState::Fetching
    } else if syncing {
        SyncState::Syncing
    } else {
        SyncState::Idle
    }
}

/// Server data with unconfirmed local changes applied in order.
fn overlay<R: Record>(
    server: &HashMap<RecordId, Arc<R>>,
    queue: &QueueState<R>,
) -> HashMap<RecordId, Arc<R>> {
    let mut items = server.clone();
    for change in queue.local_changes() {
        match change.kind {
            ChangeKind::Create | ChangeKind::Update => {
                items.insert(change.id.clone(), Arc::new(change.data.clone()));
            }
            ChangeKind::Delete => {
                items.remove(&change.id);
            }
        }
    }
    items
}

/// Read-only query over one store snapshot.
#[derive(Debug)]
pub struct Query<R> {
    items: Arc<HashMap<RecordId, Slot<R>>>,
}

impl<R> Query<R> {
    /// Get all records.
    pub fn all(self) -> Vec<Arc<R>> {
        self.items.values().map(|slot| Arc::clone(&slot.value)).collect()
    }

    /// Get the records matching a predicate.
    pub fn filter<F>(self, predicate: F) -> Vec<Arc<R>>
    where
        F: Fn(&R) -> bool,
    {
        self.items
            .values()
            .filter(|slot| predicate(&slot.value))
            .map(|slot| Arc::clone(&slot.value))
            .collect()
    }

    /// Get any one record matching a predicate.
    pub fn first<F>(self, predicate: F) -> Option<Arc<R>>
    where
        F: Fn(&R) -> bool,
    {
        self.items
            .values()
            .find(|slot| predicate(&slot.value))
            .map(|slot| Arc::clone(&slot.value))
    }

    /// Get all records ordered by a comparator.
    pub fn sorted_by<F>(self, mut compare: F) -> Vec<Arc<R>>
    where
        F: FnMut(&R, &R) -> std::cmp::Ordering,
    {
        let mut records = self.all();
        records.sort_by(|a, b| compare(a, b));
        records
    }

    /// Count records.
    pub fn count(self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::Note;
    use crate::{Result, SyncResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fetcher serving `items`, optionally failing, after `latency`.
    struct Server {
        items: Mutex<Vec<Note>>,
        fail: Mutex<Option<String>>,
        latency: Duration,
        fetches: AtomicUsize,
    }

    impl Server {
        fn new(items: Vec<Note>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items),
                fail: Mutex::new(None),
                latency: Duration::from_millis(50),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FetchTransport<Note, String> for Server {
        async fn fetch(&self, _context: &String, cancel: CancelToken) -> Result<FetchResponse<Note>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
            if let Some(message) = self.fail.lock().clone() {
                return Err(Error::Transport(message));
            }
            Ok(FetchResponse::items(self.items.lock().clone()))
        }
    }

    /// Syncer acknowledging everything, assigning `srv-N` ids to creates.
    struct Acker {
        batches: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport<Note> for Acker {
        async fn sync(&self, changes: Vec<Change<Note>>, _cancel: CancelToken) -> Result<Vec<SyncResult>> {
            let n = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(changes
                .iter()
                .map(|c| match c.kind {
                    ChangeKind::Create => SyncResult::created(&c.id, format!("srv-{n}")),
                    _ => SyncResult::success(&c.id),
                })
                .collect())
        }
    }

    fn store(server: Arc<Server>) -> Store<Note, String> {
        Store::new(
            StoreConfig::new("notes"),
            "inbox".to_string(),
            server,
            Arc::new(Acker {
                batches: AtomicUsize::new(0),
            }),
        )
    }

    fn counter(store: &Store<Note, String>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn create_assigns_temporary_id_and_remaps() {
        let store = store(Server::new(vec![]));
        let id = store.create(Note::new("", "milk"));
        assert!(id.starts_with("temp-"));
        assert_eq!(store.get_item_status(&id), Some(ItemStatus::Pending));

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(store.get(&id).is_none());
        let created = store.get("srv-1").unwrap();
        assert_eq!(created.id, "srv-1");
        assert_eq!(created.title, "milk");
        assert_eq!(store.get_item_status("srv-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_notifies_once() {
        let store = store(Server::new(vec![]));
        store.pause_sync();
        let (count, _sub) = counter(&store);

        store.create(Note::new("a", "x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        store.update("a", |note| note.title = "y".into());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("a").unwrap().title, "y");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ids_are_ignored() {
        let store = store(Server::new(vec![]));
        let (count, _sub) = counter(&store);

        store.update("ghost", |note| note.title = "boo".into());
        store.remove("ghost");

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!store.queue_state().has_local_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_hides_record_immediately() {
        let store = store(Server::new(vec![Note::new("a", "x")]));
        store.refresh().await;
        assert!(store.get("a").is_some());

        store.pause_sync();
        store.remove("a");
        assert!(store.get("a").is_none());
        assert_eq!(store.get_item_status("a"), Some(ItemStatus::Pending));

        // A refetch still hides the record while the delete is pending.
        store.refresh().await;
        assert!(store.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fetch_keeps_pending_update() {
        let server = Server::new(vec![Note::new("a", "server")]);
        let store = store(server.clone());
        store.refresh().await;

        store.pause_sync();
        store.update("a", |note| note.title = "local".into());
        store.refresh().await;

        assert_eq!(store.get("a").unwrap().title, "local");
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_keeps_items() {
        let server = Server::new(vec![Note::new("a", "x")]);
        let store = store(server.clone());
        store.refresh().await;

        *server.fail.lock() = Some("503".into());
        store.refresh().await;

        let state = store.get_state();
        assert_eq!(state.fetch_status, FetchStatus::Error);
        assert_eq!(state.fetch_error.as_deref(), Some("transport error: 503"));
        assert!(!state.loading);
        assert!(state.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_drops_records_gone_from_server() {
        let server = Server::new(vec![Note::new("a", "x"), Note::new("b", "y")]);
        let store = store(server.clone());
        store.refresh().await;
        assert_eq!(store.get_state().len(), 2);

        server.items.lock().retain(|note| note.id == "a");
        store.refresh().await;
        assert_eq!(store.get_state().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_fetch_supersedes_older() {
        let server = Server::new(vec![Note::new("a", "x")]);
        let store = store(server.clone());

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.set_context("archive".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_context("inbox".to_string()).await;
        first.await.unwrap();

        let state = store.get_state();
        assert_eq!(state.context, "inbox");
        assert_eq!(state.fetch_status, FetchStatus::Success);
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn read_cache_serves_repeat_context() {
        let server = Server::new(vec![Note::new("a", "x")]);
        let store = store(server.clone());

        store.set_context("inbox".to_string()).await;
        store.set_context("archive".to_string()).await;
        store.set_context("inbox".to_string()).await;
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);

        // Mutations invalidate the cache.
        store.pause_sync();
        store.update("a", |note| note.title = "y".into());
        store.set_context("archive".to_string()).await;
        assert_eq!(server.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_overlapping_a_mutation_is_not_cached() {
        let server = Server::new(vec![Note::new("a", "x")]);
        let store = store(server.clone());
        store.refresh().await;
        store.pause_sync();

        let loading = tokio::spawn({
            let store = store.clone();
            async move { store.set_context("archive".to_string()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.update("a", |note| note.title = "y".into());
        loading.await.unwrap();
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);

        store.set_context("inbox".to_string()).await;
        store.set_context("archive".to_string()).await;
        assert_eq!(server.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(store.get("a").unwrap().title, "y");
    }

    #[tokio::test(start_paused = true)]
    async fn handles_are_stable_until_changed() {
        let store = store(Server::new(vec![Note::new("a", "x"), Note::new("b", "y")]));
        store.refresh().await;

        let a1 = store.handle("a").unwrap();
        let b1 = store.handle("b").unwrap();

        store.pause_sync();
        store.update("b", |note| note.title = "z".into());
        store.refresh().await;

        assert_eq!(store.handle("a").unwrap(), a1);
        assert_ne!(store.handle("b").unwrap(), b1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_coalesces_notifications() {
        let store = store(Server::new(vec![]));
        store.pause_sync();
        let (count, _sub) = counter(&store);

        store.batch(|| {
            store.create(Note::new("a", "1"));
            store.batch(|| store.create(Note::new("b", "2")));
            store.remove("a");
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_state().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_filters_and_sorts() {
        let store = store(Server::new(vec![
            Note::new("a", "pear"),
            Note::new("b", "apple"),
            Note::new("c", "plum"),
        ]));
        store.refresh().await;

        let p = store.query().filter(|note| note.title.starts_with('p'));
        assert_eq!(p.len(), 2);

        let sorted = store.query().sorted_by(|a, b| a.title.cmp(&b.title));
        let titles: Vec<_> = sorted.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["apple", "pear", "plum"]);
        assert_eq!(store.query().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_notifications() {
        let store = store(Server::new(vec![]));
        let (count, _sub) = counter(&store);

        store.destroy();
        store.create(Note::new("a", "x"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(store.get("a").is_some());
        assert!(store.queue().is_destroyed());
    }
}
