//! Per model+backend serialization of upload and prune

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Hands out one async mutex per `(model, backend)` pair.
///
/// Clones share the same table, so a registry created once per process
/// serializes every run and prune touching the same destination.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a model at a backend
    pub async fn acquire(&self, model: &str, backend: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(format!("{}/{}", model, backend))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
