//! Change queue - the per-record pending-operation log.
//!
//! The queue owns everything between a local mutation and the server's
//! answer to it:
//!
//! 1. `enqueue` coalesces the change with whatever is already pending for
//!    the record and (re)arms a debounce timer
//! 2. when the timer fires, pending records move atomically to `in_flight`
//!    and their changes are sent to the [`SyncTransport`] as one batch
//! 3. results clear or record per-record errors, re-queue failures for an
//!    automatic retry (with backoff) until `max_retries`, and collect id
//!    remaps for successful creates
//!
//! State is an immutable [`QueueState`] snapshot, replaced whole on every
//! change. Listeners receive [`QueueEvent`]s.

use crate::change::{coalesce, coalesce_all, UpdateDeletePolicy};
use crate::config::QueueConfig;
use crate::subscription::{Listeners, Subscription};
use crate::{CancelToken, Change, Error, Record, RecordId, SyncResult, SyncTransport};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Public sync status of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting in the queue for the next batch
    Pending,
    /// Part of the batch currently at the server
    Syncing,
    /// Failed and parked until retried
    Error,
}

/// Failure bookkeeping for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure<R> {
    /// Last error message
    pub message: String,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// Operations parked for manual retry (empty while an automatic retry
    /// is queued, since the operations are back in `pending`)
    pub operations: Vec<Change<R>>,
    /// When the last attempt failed
    pub failed_at: DateTime<Utc>,
}

impl<R> SyncFailure<R> {
    /// Whether the failure is terminal until [`ChangeQueue::retry`].
    pub fn is_parked(&self) -> bool {
        !self.operations.is_empty()
    }
}

/// A temporary id replaced by the server's permanent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdRemap {
    pub old_id: RecordId,
    pub new_id: RecordId,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone)]
pub struct QueueState<R> {
    /// Coalesced changes not yet sent, in first-touch order
    pub pending: IndexMap<RecordId, Vec<Change<R>>>,
    /// Changes of the batch currently at the server
    pub in_flight: IndexMap<RecordId, Vec<Change<R>>>,
    /// Failure bookkeeping by record
    pub errors: IndexMap<RecordId, SyncFailure<R>>,
    /// Whether flushing is suspended
    pub paused: bool,
    /// Whether a batch is outstanding
    pub syncing: bool,
}

impl<R> Default for QueueState<R> {
    fn default() -> Self {
        Self {
            pending: IndexMap::new(),
            in_flight: IndexMap::new(),
            errors: IndexMap::new(),
            paused: false,
            syncing: false,
        }
    }
}

impl<R> QueueState<R> {
    /// Status of a record; `None` once it is fully synced.
    pub fn status(&self, id: &str) -> Option<ItemStatus> {
        if self.in_flight.contains_key(id) {
            Some(ItemStatus::Syncing)
        } else if self.pending.contains_key(id) {
            Some(ItemStatus::Pending)
        } else if self.errors.contains_key(id) {
            Some(ItemStatus::Error)
        } else {
            None
        }
    }

    /// Whether any record still has unsent or unconfirmed changes.
    pub fn has_local_changes(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty() || !self.errors.is_empty()
    }

    /// Every change not yet confirmed by the server, oldest first: parked
    /// failures, then the in-flight batch, then pending changes.
    pub fn local_changes(&self) -> impl Iterator<Item = &Change<R>> {
        self.errors
            .values()
            .flat_map(|failure| failure.operations.iter())
            .chain(self.in_flight.values().flatten())
            .chain(self.pending.values().flatten())
    }
}

/// Everything a finished batch produced, delivered in one event.
#[derive(Debug, Clone)]
pub struct BatchOutcome<R> {
    /// Temporary ids replaced by permanent ones
    pub remaps: Vec<IdRemap>,
    /// Changes the server confirmed (already carrying remapped ids)
    pub committed: Vec<Change<R>>,
    /// Queue state after the batch was processed
    pub state: Arc<QueueState<R>>,
}

/// Event delivered to queue listeners.
#[derive(Debug, Clone)]
pub enum QueueEvent<R> {
    /// Queue state changed (enqueue, flush start, pause, retry...)
    Changed(Arc<QueueState<R>>),
    /// A batch completed successfully at the transport level
    Settled(BatchOutcome<R>),
}

struct QueueInner<R: Record> {
    config: QueueConfig,
    transport: Arc<dyn SyncTransport<R>>,
    state: Mutex<Arc<QueueState<R>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    in_flight_token: Mutex<Option<CancelToken>>,
    listeners: Listeners<QueueEvent<R>>,
    destroyed: AtomicBool,
}

/// Debounced, coalescing, retrying change queue.
///
/// Cloning is cheap and yields a handle to the same queue. Methods that
/// schedule work must be called inside a Tokio runtime.
pub struct ChangeQueue<R: Record> {
    inner: Arc<QueueInner<R>>,
}

impl<R: Record> Clone for ChangeQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> ChangeQueue<R> {
    /// Create an idle queue sending batches to `transport`.
    pub fn new(config: QueueConfig, transport: Arc<dyn SyncTransport<R>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                transport,
                state: Mutex::new(Arc::new(QueueState::default())),
                timer: Mutex::new(None),
                in_flight_token: Mutex::new(None),
                listeners: Listeners::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> Arc<QueueState<R>> {
        Arc::clone(&self.inner.state.lock())
    }

    /// Status of one record.
    pub fn status(&self, id: &str) -> Option<ItemStatus> {
        self.snapshot().status(id)
    }

    /// Register a listener for queue events.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueueEvent<R>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.add(listener)
    }

    /// Check if [`ChangeQueue::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Record a mutation and schedule a debounced flush.
    ///
    /// A parked failure for the same record is superseded: its operations
    /// are folded in front of the new change and the error is cleared.
    pub fn enqueue(&self, change: Change<R>) {
        if self.is_destroyed() {
            tracing::warn!(id = %change.id, "enqueue on destroyed queue ignored");
            return;
        }

        let policy = self.inner.config.update_delete_policy;
        self.modify(|state| {
            let id = change.id.clone();
            if let Some(failure) = state.errors.shift_remove(&id) {
                requeue(state, &id, failure.operations, policy, usize::MAX);
            }

            let emptied = {
                let pending = state.pending.entry(id.clone()).or_default();
                coalesce(pending, change, policy);
                pending.is_empty()
            };
            if emptied {
                tracing::debug!(id = %id, "pending changes cancelled out");
                state.pending.shift_remove(&id);
            }
        });

        self.schedule_flush(self.inner.config.debounce);
    }

    /// Suspend flushing. An outstanding batch is allowed to finish.
    pub fn pause(&self) {
        self.modify(|state| state.paused = true);
        self.cancel_timer();
        tracing::info!("sync paused");
    }

    /// Resume flushing, immediately if work is pending.
    pub fn resume(&self) {
        let has_pending = self.modify(|state| {
            state.paused = false;
            !state.pending.is_empty()
        });
        tracing::info!(has_pending, "sync resumed");
        if has_pending {
            self.schedule_flush(Duration::ZERO);
        }
    }

    /// Move a record's failed operations back into the queue.
    pub fn retry(&self, id: &str) {
        let policy = self.inner.config.update_delete_policy;
        let requeued = self.modify(|state| match state.errors.shift_remove(id) {
            Some(failure) => {
                requeue(state, id, failure.operations, policy, usize::MAX);
                true
            }
            None => false,
        });
        if requeued {
            self.schedule_flush(self.inner.config.debounce);
        }
    }

    /// Retry every failed record.
    pub fn retry_all(&self) {
        let policy = self.inner.config.update_delete_policy;
        let requeued = self.modify(|state| {
            let failures = std::mem::take(&mut state.errors);
            let count = failures.len();
            for (id, failure) in failures {
                requeue(state, &id, failure.operations, policy, usize::MAX);
            }
            count
        });
        if requeued > 0 {
            tracing::debug!(records = requeued, "retrying failed records");
            self.schedule_flush(self.inner.config.debounce);
        }
    }

    /// Cancel the outstanding batch, if any. Its records are re-queued
    /// without counting the attempt.
    pub fn cancel_in_flight(&self) {
        if let Some(token) = self.inner.in_flight_token.lock().as_ref() {
            token.cancel();
        }
    }

    /// Stop the queue: timers are cancelled, the outstanding batch is
    /// aborted and no further work is scheduled.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_timer();
        self.cancel_in_flight();
        self.inner.listeners.clear();
        tracing::info!("change queue destroyed");
    }

    /// Skip the debounce and flush now.
    pub async fn flush_now(&self) {
        self.cancel_timer();
        self.flush().await;
    }

    /// Send one batch of pending changes.
    ///
    /// No-op while paused, while another batch is outstanding, or when
    /// nothing is pending.
    pub async fn flush(&self) {
        if self.is_destroyed() {
            return;
        }

        let max_batch = self.inner.config.max_batch_size;
        let Some((records, changes)) = self.modify_if(|state| {
            if state.paused || state.syncing || state.pending.is_empty() {
                return None;
            }
            let take = max_batch.map_or(state.pending.len(), |max| {
                max.max(1).min(state.pending.len())
            });
            let rest = state.pending.split_off(take);
            let batch = std::mem::replace(&mut state.pending, rest);
            let changes: Vec<Change<R>> = batch.values().flatten().cloned().collect();
            let records = batch.len();
            state.in_flight = batch;
            state.syncing = true;
            Some((records, changes))
        }) else {
            return;
        };

        let token = CancelToken::new();
        *self.inner.in_flight_token.lock() = Some(token.clone());
        tracing::debug!(records, changes = changes.len(), "dispatching sync batch");

        let outcome = self.inner.transport.sync(changes, token.clone()).await;
        self.inner.in_flight_token.lock().take();

        let next_flush = match outcome {
            _ if token.is_cancelled() => self.requeue_in_flight(),
            Err(err) if err.is_cancelled() => self.requeue_in_flight(),
            Err(err) => self.fail_in_flight(&err.to_string()),
            Ok(results) => self.settle(&results),
        };

        if let Some(delay) = next_flush {
            self.schedule_flush(delay);
        }
    }

    /// Apply per-record results of the outstanding batch.
    fn settle(&self, results: &[SyncResult]) -> Option<Duration> {
        let config = &self.inner.config;
        let mut remaps = Vec::new();
        let mut committed = Vec::new();

        let (next_flush, state) = self.apply(|state| {
            state.syncing = false;
            let batch = std::mem::take(&mut state.in_flight);
            let mut retried = Retried::default();

            for (id, ops) in batch {
                let outcomes: Vec<&SyncResult> = results.iter().filter(|r| r.id == id).collect();
                if let Some(message) = failure_message(&id, &outcomes) {
                    record_failure(state, config, id, ops, message, &mut retried);
                    continue;
                }

                state.errors.shift_remove(&id);
                let new_id = ops
                    .iter()
                    .any(Change::is_create)
                    .then(|| outcomes.iter().find_map(|r| r.new_id.clone()))
                    .flatten()
                    .filter(|new_id| *new_id != id);

                match new_id {
                    Some(new_id) => {
                        committed.extend(ops.iter().map(|change| change.with_id(&new_id)));
                        remaps.push(IdRemap { old_id: id, new_id });
                    }
                    None => committed.extend(ops),
                }
            }

            for remap in &remaps {
                rekey(state, remap);
            }
            retried.next_flush(state, config)
        });

        if !remaps.is_empty() {
            tracing::debug!(count = remaps.len(), "remapping temporary ids");
        }
        self.inner.listeners.emit(&QueueEvent::Settled(BatchOutcome {
            remaps,
            committed,
            state,
        }));
        next_flush
    }

    /// The whole batch failed at the transport level.
    fn fail_in_flight(&self, message: &str) -> Option<Duration> {
        tracing::warn!(error = %message, "sync batch failed");
        let config = &self.inner.config;
        self.modify(|state| {
            state.syncing = false;
            let batch = std::mem::take(&mut state.in_flight);
            let mut retried = Retried::default();
            for (id, ops) in batch {
                record_failure(state, config, id, ops, message.to_string(), &mut retried);
            }
            retried.next_flush(state, config)
        })
    }

    /// Put the batch back in front of the queue without penalty.
    fn requeue_in_flight(&self) -> Option<Duration> {
        let config = &self.inner.config;
        let policy = config.update_delete_policy;
        let next_flush = self.modify(|state| {
            state.syncing = false;
            let batch = std::mem::take(&mut state.in_flight);
            for (index, (id, ops)) in batch.into_iter().enumerate() {
                requeue(state, &id, ops, policy, index);
            }
            Retried::default().next_flush(state, config)
        });
        tracing::debug!("sync batch cancelled, changes re-queued");
        next_flush
    }

    fn schedule_flush(&self, delay: Duration) {
        if self.is_destroyed() {
            return;
        }

        let mut timer = self.inner.timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        if self.snapshot().paused {
            return;
        }

        let queue = Arc::downgrade(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = queue.upgrade() {
                let queue = ChangeQueue { inner };
                // Detached so that re-arming the timer never aborts a batch.
                tokio::spawn(async move { queue.flush().await });
            }
        }));
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
    }

    /// Replace the state with a modified copy without notifying.
    fn apply<T>(&self, f: impl FnOnce(&mut QueueState<R>) -> T) -> (T, Arc<QueueState<R>>) {
        let mut guard = self.inner.state.lock();
        let mut next = QueueState::clone(&guard);
        let result = f(&mut next);
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        (result, next)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut QueueState<R>) -> T) -> T {
        let (result, state) = self.apply(f);
        self.inner.listeners.emit(&QueueEvent::Changed(state));
        result
    }

    /// Like `modify`, but the change is discarded when `f` returns `None`.
    fn modify_if<T>(&self, f: impl FnOnce(&mut QueueState<R>) -> Option<T>) -> Option<T> {
        let (result, state) = {
            let mut guard = self.inner.state.lock();
            let mut next = QueueState::clone(&guard);
            let result = f(&mut next)?;
            let next = Arc::new(next);
            *guard = Arc::clone(&next);
            (result, next)
        };
        self.inner.listeners.emit(&QueueEvent::Changed(state));
        Some(result)
    }
}

/// Tracks re-queued failures of one batch to place them in order and
/// compute the backoff for the follow-up flush.
#[derive(Default)]
struct Retried {
    count: usize,
    max_retry_count: u32,
}

impl Retried {
    fn next_flush<R>(&self, state: &QueueState<R>, config: &QueueConfig) -> Option<Duration> {
        if state.pending.is_empty() || state.paused {
            return None;
        }
        if self.max_retry_count == 0 {
            return Some(config.debounce);
        }
        Some(config.debounce.max(config.backoff.delay_for(self.max_retry_count)))
    }
}

fn failure_message(id: &str, outcomes: &[&SyncResult]) -> Option<String> {
    if outcomes.is_empty() {
        return Some(Error::MissingResult(id.to_string()).to_string());
    }
    outcomes
        .iter()
        .find(|r| !r.is_success())
        .map(|r| r.error.clone().unwrap_or_else(|| "sync failed".to_string()))
}

fn record_failure<R: Record>(
    state: &mut QueueState<R>,
    config: &QueueConfig,
    id: RecordId,
    ops: Vec<Change<R>>,
    message: String,
    retried: &mut Retried,
) {
    let policy = config.update_delete_policy;
    let retry_count = state.errors.get(&id).map_or(0, |f| f.retry_count) + 1;
    let failed_at = Utc::now();

    if retry_count < config.max_retries {
        tracing::warn!(id = %id, retry_count, error = %message, "sync failed, retrying");
        requeue(state, &id, ops, policy, retried.count);
        if !state.pending.contains_key(&id) {
            // The failed ops cancelled out against a newer change.
            tracing::debug!(id = %id, "failed changes cancelled out");
            state.errors.shift_remove(&id);
            return;
        }
        retried.count += 1;
        retried.max_retry_count = retried.max_retry_count.max(retry_count);
        state.errors.insert(
            id,
            SyncFailure {
                message,
                retry_count,
                operations: Vec::new(),
                failed_at,
            },
        );
    } else if state.pending.contains_key(&id) {
        // A newer mutation arrived during the attempt and supersedes the
        // failure, exactly as if it had been enqueued afterwards.
        requeue(state, &id, ops, policy, usize::MAX);
        state.errors.shift_remove(&id);
    } else {
        tracing::warn!(id = %id, retry_count, error = %message, "sync failed, giving up");
        state.errors.insert(
            id,
            SyncFailure {
                message,
                retry_count,
                operations: ops,
                failed_at,
            },
        );
    }
}

/// Merge `ops` in front of any newer pending changes for `id` and place the
/// record at `at` in first-touch order (clamped; an existing entry keeps its
/// position).
fn requeue<R: Record>(
    state: &mut QueueState<R>,
    id: &str,
    ops: Vec<Change<R>>,
    policy: UpdateDeletePolicy,
    at: usize,
) {
    if ops.is_empty() {
        return;
    }

    if let Some(newer) = state.pending.get_mut(id) {
        let merged = coalesce_all(ops.into_iter().chain(newer.drain(..)), policy);
        if merged.is_empty() {
            state.pending.shift_remove(id);
        } else {
            *newer = merged;
        }
        return;
    }

    let merged = coalesce_all(ops, policy);
    if !merged.is_empty() {
        let at = at.min(state.pending.len());
        state.pending.shift_insert(at, id.to_string(), merged);
    }
}

/// Move queue entries of a remapped record to its permanent id.
fn rekey<R: Record>(state: &mut QueueState<R>, remap: &IdRemap) {
    if let Some(index) = state.pending.get_index_of(&remap.old_id) {
        if let Some((_, ops)) = state.pending.shift_remove_index(index) {
            let ops = ops.iter().map(|c| c.with_id(&remap.new_id)).collect();
            state.pending.shift_insert(index, remap.new_id.clone(), ops);
        }
    }
    if let Some(mut failure) = state.errors.shift_remove(&remap.old_id) {
        failure.operations = failure
            .operations
            .iter()
            .map(|c| c.with_id(&remap.new_id))
            .collect();
        state.errors.insert(remap.new_id.clone(), failure);
    }
}
