//! Boundary with the network layer.
//!
//! The engine performs no I/O itself. Applications implement
//! [`FetchTransport`] and [`SyncTransport`] over whatever protocol they use;
//! the store and queue call them with a fresh [`CancelToken`] per attempt.

use crate::{CancelToken, Change, Record, RecordId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of one change in a sync batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
}

/// Per-record result returned by a sync call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Record ID the result refers to (the id that was sent)
    pub id: RecordId,
    /// Whether the change was committed
    pub status: SyncStatus,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Permanent id assigned by the server to a created record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_id: Option<RecordId>,
}

impl SyncResult {
    /// A successful result.
    pub fn success(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            status: SyncStatus::Success,
            error: None,
            new_id: None,
        }
    }

    /// A successful create that the server stored under `new_id`.
    pub fn created(id: impl Into<RecordId>, new_id: impl Into<RecordId>) -> Self {
        Self {
            new_id: Some(new_id.into()),
            ..Self::success(id)
        }
    }

    /// A failed result.
    pub fn error(id: impl Into<RecordId>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SyncStatus::Error,
            error: Some(message.into()),
            new_id: None,
        }
    }

    /// Check if the change was committed.
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Server response to a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse<R> {
    /// Server-truth records for the context
    pub items: Vec<R>,
    /// Opaque server-side state (cursors, totals) passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<serde_json::Value>,
}

impl<R> FetchResponse<R> {
    /// A response carrying only records.
    pub fn items(items: Vec<R>) -> Self {
        Self {
            items,
            server_state: None,
        }
    }
}

impl<R> From<Vec<R>> for FetchResponse<R> {
    fn from(items: Vec<R>) -> Self {
        Self::items(items)
    }
}

/// Supplies the server-truth baseline for a context.
#[async_trait]
pub trait FetchTransport<R: Record, C>: Send + Sync {
    /// Fetch all records for `context`.
    ///
    /// Return [`Error::Cancelled`](crate::Error::Cancelled) when `cancel`
    /// fires; any other error is reported as a fetch failure.
    async fn fetch(&self, context: &C, cancel: CancelToken) -> Result<FetchResponse<R>>;
}

/// Commits a coalesced batch of changes.
#[async_trait]
pub trait SyncTransport<R: Record>: Send + Sync {
    /// Send `changes` (ordered by first touch, per-record order preserved)
    /// and report one result per change.
    ///
    /// An `Err` fails every record in the batch, except
    /// [`Error::Cancelled`](crate::Error::Cancelled) which re-queues them
    /// without counting an attempt.
    async fn sync(&self, changes: Vec<Change<R>>, cancel: CancelToken) -> Result<Vec<SyncResult>>;
}
