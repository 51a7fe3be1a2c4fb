//! Immutable store snapshots.
//!
//! Every store mutation builds a new [`StoreState`] and swaps it in whole,
//! so a snapshot obtained from `get_state()` never changes underneath its
//! reader.

use crate::record::Slot;
use crate::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What the store is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Syncing,
}

/// Outcome of the most recent fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// A point-in-time view of a store.
#[derive(Debug)]
pub struct StoreState<R, C> {
    /// Query context the items were fetched for
    pub context: C,
    /// Server data overlaid with unconfirmed local changes
    pub items: Arc<HashMap<RecordId, Slot<R>>>,
    /// Fetch or sync activity
    pub sync_state: SyncState,
    /// Whether a fetch is outstanding
    pub loading: bool,
    /// Outcome of the most recent fetch
    pub fetch_status: FetchStatus,
    /// Message of the most recent failed fetch
    pub fetch_error: Option<String>,
    /// Opaque server state returned with the last fetch
    pub server_state: Option<serde_json::Value>,
}

impl<R, C> StoreState<R, C> {
    /// Create an empty state for a context.
    pub fn new(context: C) -> Self {
        Self {
            context,
            items: Arc::new(HashMap::new()),
            sync_state: SyncState::Idle,
            loading: false,
            fetch_status: FetchStatus::Idle,
            fetch_error: None,
            server_state: None,
        }
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<&R> {
        self.items.get(id).map(|slot| slot.value.as_ref())
    }

    /// Check if a record is present.
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// All records, in no particular order.
    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.items.values().map(|slot| slot.value.as_ref())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if there are no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<R, C: Clone> Clone for StoreState<R, C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            items: Arc::clone(&self.items),
            sync_state: self.sync_state,
            loading: self.loading,
            fetch_status: self.fetch_status,
            fetch_error: self.fetch_error.clone(),
            server_state: self.server_state.clone(),
        }
    }
}
