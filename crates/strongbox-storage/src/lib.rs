//! # strongbox-storage
//!
//! Destinations for finished backup sets.
//!
//! # Features
//!
//! - **Local**: sets reassembled into one file per run under a base directory
//! - **Object store**: multipart upload to S3-compatible services, one part
//!   per chunk, with per-part retry and abort on failure
//! - **Retention**: keep the newest N complete sets, never touch partial ones
//! - **Locking**: upload and prune serialized per model and backend
//!
//! Every backend writes the manifest last; a set without a manifest is
//! reported as partial and is invisible to retention.

pub mod local;
pub mod lock;
pub mod object_store;
pub mod retention;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use strongbox_core::types::{
    Chunk, Manifest, PartialBackupSet, RetryPolicy, RunId, StorageConfig, StoredBackupSet,
};
use strongbox_core::{AbortSignal, Error, Result};

pub use local::LocalBackend;
pub use lock::LockRegistry;
pub use object_store::{MemoryObjectStore, ObjectStoreBackend, ObjectStoreClient, S3ObjectStore};
pub use retention::plan_retention;

/// Ordered chunks of one spooled stream, read independently per backend
pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// Stored sets of one model at one backend
#[derive(Debug, Clone, Default)]
pub struct SetListing {
    /// Sets with a manifest, newest first
    pub complete: Vec<StoredBackupSet>,
    /// Run data without a manifest
    pub partial: Vec<PartialBackupSet>,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub kept: Vec<RunId>,
    pub deleted: Vec<RunId>,
    /// Sets that should have been deleted but were left intact
    pub failed: Vec<(RunId, String)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A place backup sets are written to, listed from and pruned at
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Configured name, unique within a model
    fn name(&self) -> &str;

    /// Backend type ("local", "s3")
    fn kind(&self) -> &'static str;

    /// Store all chunks in order, then the manifest
    async fn store(
        &self,
        manifest: &Manifest,
        chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<StoredBackupSet>;

    /// List complete and partial sets of a model
    async fn list(&self, model: &str) -> Result<SetListing>;

    /// Delete all but the newest `keep` complete sets of a model
    async fn prune(&self, model: &str, keep: u32) -> Result<PruneReport>;
}

/// Build the backend a storage entry describes
pub async fn build_backend(
    config: &StorageConfig,
    retry: &RetryPolicy,
) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local(local) => Ok(Arc::new(LocalBackend::from_config(local))),
        StorageConfig::S3(s3) => {
            let name = config.name();
            let client = S3ObjectStore::connect(&name, s3).await?;
            Ok(Arc::new(ObjectStoreBackend::new(
                name,
                Arc::new(client),
                &s3.prefix,
                retry.clone(),
            )))
        }
    }
}

/// Checks that chunks arrive contiguously from 0 and end with a final chunk
#[derive(Debug, Default)]
pub struct SequenceGuard {
    next: u64,
    finished: bool,
    bytes: u64,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next chunk
    pub fn accept(&mut self, chunk: &Chunk) -> Result<()> {
        if self.finished {
            return Err(Error::corrupt(format!(
                "chunk {} arrived after the final chunk",
                chunk.sequence_number
            )));
        }
        if chunk.sequence_number != self.next {
            return Err(Error::ChunkGap {
                expected: self.next,
                found: chunk.sequence_number,
            });
        }
        self.next += 1;
        self.bytes += chunk.payload.len() as u64;
        self.finished = chunk.is_final;
        Ok(())
    }

    /// Verify the stream ended where the manifest says it does
    pub fn finish(&self, manifest: &Manifest) -> Result<()> {
        if !self.finished {
            return Err(Error::corrupt(format!(
                "stream ended after {} chunks without a final chunk",
                self.next
            )));
        }
        if self.next != manifest.total_chunks || self.bytes != manifest.total_bytes {
            return Err(Error::corrupt(format!(
                "received {} chunks / {} bytes, manifest lists {} / {}",
                self.next, self.bytes, manifest.total_chunks, manifest.total_bytes
            )));
        }
        Ok(())
    }

    pub fn chunks_seen(&self) -> u64 {
        self.next
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_sequence_guard_accepts_contiguous_stream() {
        let data = b"0123456789";
        let manifest = manifest_for("m", data, 4, 0);
        let mut guard = SequenceGuard::new();
        for chunk in chunks_of(data, 4) {
            guard.accept(&chunk).unwrap();
        }
        guard.finish(&manifest).unwrap();
        assert_eq!(guard.chunks_seen(), 3);
    }

    #[test]
    fn test_sequence_guard_detects_gap() {
        let mut chunks = chunks_of(b"0123456789", 4);
        chunks.remove(1);
        let mut guard = SequenceGuard::new();
        guard.accept(&chunks[0]).unwrap();
        let err = guard.accept(&chunks[1]).unwrap_err();
        assert!(matches!(err, Error::ChunkGap { expected: 1, found: 2 }));
    }

    #[test]
    fn test_sequence_guard_requires_final_chunk() {
        let data = b"01234567";
        let manifest = manifest_for("m", data, 4, 0);
        let chunks = chunks_of(data, 4);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_empty() && chunks[2].is_final);

        let mut guard = SequenceGuard::new();
        guard.accept(&chunks[0]).unwrap();
        guard.accept(&chunks[1]).unwrap();
        assert!(guard.finish(&manifest).is_err());
    }
}
