//! Cooperative cancellation for transport calls.

use std::sync::Arc;
use tokio::sync::watch;

/// A cancellation flag handed to every fetch and sync call.
///
/// Clones share the same flag. Transports may poll [`is_cancelled`] or
/// `select!` on [`cancelled`]; the engine checks the flag again once the call
/// returns and discards the outcome of a cancelled call.
///
/// [`is_cancelled`]: CancelToken::is_cancelled
/// [`cancelled`]: CancelToken::cancelled
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
