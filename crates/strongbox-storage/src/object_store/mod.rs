//! S3-compatible object store backend
//!
//! The backend drives multipart uploads through the [`ObjectStoreClient`]
//! seam, so the AWS SDK client and the in-memory store share one upload,
//! listing and pruning implementation.

mod backend;
mod memory;
mod s3;

use async_trait::async_trait;
use strongbox_core::Result;

pub use backend::ObjectStoreBackend;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// A part accepted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based part number
    pub part_number: i32,
    pub etag: String,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Minimal object store operations needed for backup sets.
///
/// Errors are `Error::Transfer`; `transient` marks those worth retrying.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Start a multipart upload and return its id
    async fn create_multipart(&self, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<UploadedPart>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    /// Discard an unfinished upload and its parts
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// All objects whose key starts with `prefix`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete_objects(&self, keys: Vec<String>) -> Result<()>;
}
