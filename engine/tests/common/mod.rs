//! Shared fixtures for integration tests: a `Todo` record and an in-memory
//! server implementing both transports.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tether_engine::{
    CancelToken, Change, ChangeKind, Error, FetchResponse, FetchTransport, Record, RecordId,
    Result, Store, StoreConfig, SyncResult, SyncTransport,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: RecordId,
    pub title: String,
    pub done: bool,
}

impl Todo {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            done: false,
        }
    }
}

impl Record for Todo {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }
}

/// Fetch parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filter {
    pub done: Option<bool>,
}

/// In-memory server. Creates are stored under `srv-N` ids.
pub struct FakeServer {
    pub records: Mutex<BTreeMap<RecordId, Todo>>,
    pub batches: Mutex<Vec<Vec<Change<Todo>>>>,
    pub fetches: AtomicUsize,
    /// Ids whose changes are rejected
    pub rejected: Mutex<HashSet<RecordId>>,
    pub offline: AtomicBool,
    pub latency: Duration,
    next_id: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::from_millis(100))
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            rejected: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            latency,
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn seed(&self, todos: impl IntoIterator<Item = Todo>) {
        let mut records = self.records.lock();
        for todo in todos {
            records.insert(todo.id.clone(), todo);
        }
    }

    pub fn batches(&self) -> Vec<Vec<Change<Todo>>> {
        self.batches.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    async fn wait(&self, cancel: &CancelToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.latency) => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[async_trait]
impl FetchTransport<Todo, Filter> for FakeServer {
    async fn fetch(&self, context: &Filter, cancel: CancelToken) -> Result<FetchResponse<Todo>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.wait(&cancel).await?;
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("server unreachable".into()));
        }
        let items = self
            .records
            .lock()
            .values()
            .filter(|todo| context.done.map_or(true, |done| todo.done == done))
            .cloned()
            .collect();
        Ok(FetchResponse::items(items))
    }
}

#[async_trait]
impl SyncTransport<Todo> for FakeServer {
    async fn sync(&self, changes: Vec<Change<Todo>>, cancel: CancelToken) -> Result<Vec<SyncResult>> {
        self.batches.lock().push(changes.clone());
        self.wait(&cancel).await?;
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("server unreachable".into()));
        }

        let rejected = self.rejected.lock().clone();
        let mut records = self.records.lock();
        let results = changes
            .iter()
            .map(|change| {
                if rejected.contains(&change.id) {
                    return SyncResult::error(&change.id, "rejected");
                }
                match change.kind {
                    ChangeKind::Create => {
                        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                        let new_id = format!("srv-{n}");
                        records.insert(new_id.clone(), change.data.with_id(new_id.clone()));
                        SyncResult::created(&change.id, new_id)
                    }
                    ChangeKind::Update => {
                        records.insert(change.id.clone(), change.data.clone());
                        SyncResult::success(&change.id)
                    }
                    ChangeKind::Delete => {
                        records.remove(&change.id);
                        SyncResult::success(&change.id)
                    }
                }
            })
            .collect();
        Ok(results)
    }
}

pub fn store(server: &Arc<FakeServer>) -> Store<Todo, Filter> {
    store_with(server, StoreConfig::new("todos"))
}

pub fn store_with(server: &Arc<FakeServer>, config: StoreConfig) -> Store<Todo, Filter> {
    Store::new(config, Filter::default(), server.clone(), server.clone())
}

/// Let every timer and in-flight request run to completion.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(300)).await;
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
