//! # Tether Engine
//!
//! A local-first sync engine.
//!
//! This crate keeps a client-side mirror of server-owned records, applies
//! local mutations to it immediately and reconciles them with the server in
//! the background: batched, coalesced, retried with backoff, and with
//! temporary ids swapped for permanent ones when the server assigns them.
//!
//! ## Design Principles
//!
//! - **No IO of its own**: the network is behind [`FetchTransport`] and
//!   [`SyncTransport`], implemented by the application
//! - **Optimistic**: reads always reflect local intent; a stale fetch never
//!   hides an unconfirmed local edit
//! - **Snapshots**: every state is an immutable `Arc` snapshot, so readers
//!   never observe a half-applied change
//!
//! ## Core Concepts
//!
//! ### Change Queue
//!
//! The [`ChangeQueue`] records [`Change`]s per record, coalesces them
//! ([`coalesce`]), and sends them to the server after a debounce window.
//! Failed records are retried up to `max_retries` times, then parked until
//! [`ChangeQueue::retry`].
//!
//! ### Store
//!
//! The [`Store`] overlays pending changes on the last-known server data and
//! notifies subscribers with a new [`StoreState`] on every change.
//! [`Store::batch`] groups several mutations into one notification.
//! Fetch results are cached per context in a [`ReadCache`], and
//! [`Store::handle`] returns [`RecordHandle`]s that stay equal until the
//! record actually changes.
//!
//! ### Tree
//!
//! The [`Tree`] interprets a store of [`TreeRecord`]s as a hierarchy whose
//! ids are materialized paths (`"parent.child"`), adding ordering, moves,
//! subtree clones and cascading removes.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tether_engine::{
//!     CancelToken, Change, FetchResponse, FetchTransport, ItemStatus, Record, RecordId,
//!     Result, Store, StoreConfig, SyncResult, SyncTransport,
//! };
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Todo {
//!     id: RecordId,
//!     title: String,
//! }
//!
//! impl Record for Todo {
//!     fn id(&self) -> &str {
//!         &self.id
//!     }
//!
//!     fn set_id(&mut self, id: RecordId) {
//!         self.id = id;
//!     }
//! }
//!
//! struct Api;
//!
//! #[async_trait]
//! impl FetchTransport<Todo, ()> for Api {
//!     async fn fetch(&self, _context: &(), _cancel: CancelToken) -> Result<FetchResponse<Todo>> {
//!         Ok(FetchResponse::items(Vec::new()))
//!     }
//! }
//!
//! #[async_trait]
//! impl SyncTransport<Todo> for Api {
//!     async fn sync(&self, changes: Vec<Change<Todo>>, _cancel: CancelToken) -> Result<Vec<SyncResult>> {
//!         Ok(changes.iter().map(|c| SyncResult::created(&c.id, "todo-1")).collect())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! // 1. Create a store and load the server baseline
//! let api = Arc::new(Api);
//! let store = Store::new(StoreConfig::new("todos"), (), api.clone(), api);
//! store.refresh().await;
//!
//! // 2. Mutate optimistically; the record is readable right away
//! let id = store.create(Todo { id: String::new(), title: "Buy milk".into() });
//! assert_eq!(store.get(&id).unwrap().title, "Buy milk");
//! assert_eq!(store.get_item_status(&id), Some(ItemStatus::Pending));
//!
//! // 3. Observe changes
//! let subscription = store.subscribe(|state| println!("{} todos", state.len()));
//! subscription.unsubscribe();
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`StoreConfig::from_env`] reads `TETHER_*` variables (debounce, retries,
//! batch size, cache bounds, update/delete policy) over the defaults.

pub mod cache;
pub mod cancel;
pub mod change;
pub mod config;
pub mod error;
pub mod identity;
pub mod queue;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod store;
mod subscription;
pub mod transport;
pub mod tree;

// Re-export main types at crate root
pub use cache::ReadCache;
pub use cancel::CancelToken;
pub use change::{coalesce, coalesce_all, Change, ChangeKind, UpdateDeletePolicy};
pub use config::{BackoffConfig, CacheConfig, ConfigError, QueueConfig, StoreConfig};
pub use error::{Error, Result};
pub use identity::{IdentityCache, RecordHandle};
pub use queue::{
    BatchOutcome, ChangeQueue, IdRemap, ItemStatus, QueueEvent, QueueState, SyncFailure,
};
pub use record::{Record, Slot};
pub use registry::StoreRegistry;
pub use snapshot::{FetchStatus, StoreState, SyncState};
pub use store::{Context, Query, Store};
pub use subscription::Subscription;
pub use transport::{FetchResponse, FetchTransport, SyncResult, SyncStatus, SyncTransport};
pub use tree::{NodeValue, Tree, TreeNode, TreeRecord};

/// Type aliases for clarity
pub type RecordId = String;
pub type Version = u64;
