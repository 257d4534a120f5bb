//! Run-level cancellation

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// A cloneable abort flag shared by every stage of a run.
///
/// Synchronous stages poll [`AbortSignal::check`]; async stages can await
/// [`AbortSignal::cancelled`] inside a `tokio::select!`.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation of everything holding a clone of this signal
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns `Error::Cancelled` once the signal has fired
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the signal fires
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            // Sender lives as long as any clone of self, so this never resolves.
            std::future::pending::<()>().await;
        }
    }
}
