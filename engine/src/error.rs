//! Error types for the Tether engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the Tether engine.
///
/// Mutations never return these: their outcome is observed through item
/// status. Errors surface from transports, the registry and serialization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    // Registry errors
    #[error("store already registered: {0}")]
    AlreadyRegistered(String),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    // Data errors
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("no sync result returned for record: {0}")]
    MissingResult(RecordId),
}

impl Error {
    /// Whether this error represents cooperative cancellation rather than
    /// a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
