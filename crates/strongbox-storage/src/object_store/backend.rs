//! Multipart upload, listing and pruning over an [`ObjectStoreClient`]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use strongbox_core::retry::{RetryError, RetryExecutorBuilder, TracingObserver, TransientOnly};
use strongbox_core::types::{
    Manifest, PartialBackupSet, RetryPolicy, RunId, StoredBackupSet, MANIFEST_FILENAME,
    MAX_OBJECT_STORE_PARTS,
};
use strongbox_core::{AbortSignal, Error, Result};

use super::{ObjectStoreClient, UploadedPart};
use crate::retention::{plan_retention, sort_newest_first};
use crate::{ChunkStream, PruneReport, SequenceGuard, SetListing, StorageBackend};

/// Stores each set as one multipart object plus a manifest object
pub struct ObjectStoreBackend {
    name: String,
    client: Arc<dyn ObjectStoreClient>,
    prefix: String,
    retry: RetryPolicy,
}

impl ObjectStoreBackend {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ObjectStoreClient>,
        prefix: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            prefix: prefix.trim_matches('/').to_string(),
            retry,
        }
    }

    fn model_prefix(&self, model: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/", model)
        } else {
            format!("{}/{}/", self.prefix, model)
        }
    }

    fn set_prefix(&self, model: &str, run_id: &RunId) -> String {
        format!("{}{}", self.model_prefix(model), run_id)
    }

    /// Run `op` under the backend's retry policy
    async fn with_retry<T, F, Fut>(&self, operation: String, abort: &AbortSignal, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        RetryExecutorBuilder::new()
            .with_policy(self.retry.clone())
            .with_predicate(TransientOnly)
            .with_observer(TracingObserver::new(operation.clone()))
            .with_abort(abort.clone())
            .build()
            .execute(op)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted {
                    attempts, source, ..
                } => Error::permanent(
                    &self.name,
                    format!("{} failed after {} attempts: {}", operation, attempts, source),
                ),
                other => other.into_error(),
            })
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        manifest: &Manifest,
        mut chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<Vec<UploadedPart>> {
        let mut guard = SequenceGuard::new();
        let mut parts = Vec::new();

        while let Some(chunk) = chunks.next().await {
            abort.check()?;
            let chunk = chunk?;
            guard.accept(&chunk)?;

            let part_number = i32::try_from(chunk.sequence_number + 1).map_err(|_| {
                Error::permanent(&self.name, "too many parts for one multipart upload")
            })?;
            let body = chunk.payload;
            let client = &self.client;
            let part = self
                .with_retry(format!("{} part {}", key, part_number), abort, || {
                    client.upload_part(key, upload_id, part_number, body.clone())
                })
                .await?;
            debug!(
                backend = %self.name,
                part = part_number,
                bytes = body.len(),
                "Uploaded part"
            );
            parts.push(part);
        }
        guard.finish(manifest)?;
        Ok(parts)
    }

    /// Best effort; a failure here only leaves an orphaned upload behind
    async fn abort_upload(&self, key: &str, upload_id: &str) {
        match self.client.abort_multipart(key, upload_id).await {
            Ok(()) => info!(backend = %self.name, "Aborted multipart upload of {}", key),
            Err(e) => error!(
                backend = %self.name,
                "Could not abort multipart upload {} of {}: {}",
                upload_id,
                key,
                e
            ),
        }
    }

    async fn upload_data(
        &self,
        key: &str,
        manifest: &Manifest,
        chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<()> {
        let client = &self.client;
        let upload_id = self
            .with_retry(format!("{} create upload", key), abort, || {
                client.create_multipart(key)
            })
            .await?;
        debug!(backend = %self.name, "Started multipart upload {} for {}", upload_id, key);

        let result = async {
            let parts = self
                .upload_parts(key, &upload_id, manifest, chunks, abort)
                .await?;
            abort.check()?;
            self.with_retry(format!("{} complete upload", key), abort, || {
                client.complete_multipart(key, &upload_id, parts.clone())
            })
            .await
        }
        .await;

        if result.is_err() {
            self.abort_upload(key, &upload_id).await;
        }
        result
    }

    /// Group listed keys by run id
    async fn runs(&self, model: &str) -> Result<BTreeMap<RunId, Vec<String>>> {
        let model_prefix = self.model_prefix(model);
        let objects = self.client.list_objects(&model_prefix).await?;

        let mut runs: BTreeMap<RunId, Vec<String>> = BTreeMap::new();
        for object in objects {
            let Some(rest) = object.key.strip_prefix(&model_prefix) else {
                continue;
            };
            let Some((segment, _)) = rest.split_once('/') else {
                continue;
            };
            if let Some(run_id) = RunId::parse(segment) {
                runs.entry(run_id).or_default().push(object.key);
            }
        }
        Ok(runs)
    }

    /// Delete data objects first and the manifest last
    async fn delete_set(&self, keys: Vec<String>) -> Result<()> {
        let (manifests, data): (Vec<String>, Vec<String>) = keys
            .into_iter()
            .partition(|k| k.ends_with(&format!("/{}", MANIFEST_FILENAME)));
        if !data.is_empty() {
            self.client.delete_objects(data).await?;
        }
        if !manifests.is_empty() {
            self.client.delete_objects(manifests).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn store(
        &self,
        manifest: &Manifest,
        chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<StoredBackupSet> {
        abort.check()?;
        let set_prefix = self.set_prefix(&manifest.model_name, &manifest.run_id);
        let data_key = format!("{}/{}", set_prefix, manifest.object);
        let manifest_key = format!("{}/{}", set_prefix, MANIFEST_FILENAME);

        if manifest.total_chunks > MAX_OBJECT_STORE_PARTS {
            return Err(Error::permanent(
                &self.name,
                format!(
                    "{} needs {} parts, over the multipart limit of {}",
                    data_key, manifest.total_chunks, MAX_OBJECT_STORE_PARTS
                ),
            ));
        }

        info!(backend = %self.name, "Uploading {} in {} parts", data_key, manifest.total_chunks);
        self.upload_data(&data_key, manifest, chunks, abort).await?;

        let body = manifest.to_json()?.into_bytes();
        let client = &self.client;
        let put = self
            .with_retry(format!("{} put", manifest_key), abort, || {
                client.put_object(&manifest_key, body.clone())
            })
            .await;
        if let Err(e) = put {
            // Without a manifest the object is a partial set; do not leave it billed.
            if let Err(cleanup) = self.client.delete_objects(vec![data_key.clone()]).await {
                warn!("Could not remove {} after manifest failure: {}", data_key, cleanup);
            }
            return Err(e);
        }

        info!(backend = %self.name, "Stored {} ({} bytes)", set_prefix, manifest.total_bytes);
        Ok(StoredBackupSet {
            model_name: manifest.model_name.clone(),
            run_id: manifest.run_id.clone(),
            location: set_prefix,
            manifest: manifest.clone(),
        })
    }

    async fn list(&self, model: &str) -> Result<SetListing> {
        let mut listing = SetListing::default();

        for (run_id, keys) in self.runs(model).await? {
            let location = self.set_prefix(model, &run_id);
            let manifest_key = format!("{}/{}", location, MANIFEST_FILENAME);

            if !keys.contains(&manifest_key) {
                listing.partial.push(PartialBackupSet {
                    model_name: model.to_string(),
                    run_id,
                    location,
                });
                continue;
            }

            let bytes = self.client.get_object(&manifest_key).await?;
            let parsed = std::str::from_utf8(&bytes)
                .map_err(|e| Error::corrupt(e.to_string()))
                .and_then(Manifest::from_json);
            match parsed {
                Ok(manifest) => listing.complete.push(StoredBackupSet {
                    model_name: model.to_string(),
                    run_id,
                    location,
                    manifest,
                }),
                Err(e) => {
                    warn!("Ignoring unreadable manifest {}: {}", manifest_key, e);
                    listing.partial.push(PartialBackupSet {
                        model_name: model.to_string(),
                        run_id,
                        location,
                    });
                }
            }
        }

        sort_newest_first(&mut listing.complete);
        listing.partial.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(listing)
    }

    async fn prune(&self, model: &str, keep: u32) -> Result<PruneReport> {
        if keep == 0 {
            return Err(Error::prune(&self.name, "refusing to keep zero backups"));
        }

        let listing = self.list(model).await?;
        let (kept, expired) = plan_retention(&listing.complete, keep);
        let mut runs = self.runs(model).await?;
        let mut report = PruneReport {
            kept,
            ..Default::default()
        };

        for run_id in expired {
            let keys = runs.remove(&run_id).unwrap_or_default();
            match self.delete_set(keys).await {
                Ok(()) => {
                    info!(backend = %self.name, "Pruned {}/{}", model, run_id);
                    report.deleted.push(run_id);
                }
                Err(e) => {
                    warn!(backend = %self.name, "Could not prune {}/{}: {}", model, run_id, e);
                    report.failed.push((run_id, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MemoryObjectStore, MockObjectStoreClient};
    use crate::test_support::{manifest_for, stream_of};
    use strongbox_core::types::RetryStrategy;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            strategy: RetryStrategy::FixedDelay,
            backoff_multiplier: 1.0,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn backend(store: &Arc<MemoryObjectStore>) -> ObjectStoreBackend {
        ObjectStoreBackend::new("s3", store.clone(), "/backup/", quick_retry())
    }

    #[tokio::test]
    async fn test_store_uploads_parts_then_manifest() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = backend(&store);

        let data = b"abcdefghij".to_vec();
        let manifest = manifest_for("machine", &data, 4, 0);
        let set = backend
            .store(&manifest, stream_of(&data, 4), &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(set.location, format!("backup/machine/{}", manifest.run_id));
        assert_eq!(
            store.object(&format!("{}/machine.sbox", set.location)),
            Some(data)
        );
        assert!(store
            .object(&format!("{}/manifest.json", set.location))
            .is_some());
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_succeed() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_parts(2, true);
        let backend = backend(&store);

        let data = b"0123456789".to_vec();
        let manifest = manifest_for("machine", &data, 4, 0);
        backend
            .store(&manifest, stream_of(&data, 4), &AbortSignal::new())
            .await
            .unwrap();

        let listing = backend.list("machine").await.unwrap();
        assert_eq!(listing.complete.len(), 1);
        assert!(listing.partial.is_empty());
        assert_eq!(store.part_attempts(), 5);
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_parts(3, true);
        let backend = backend(&store);

        let data = b"0123456789".to_vec();
        let manifest = manifest_for("machine", &data, 4, 0);
        let err = backend
            .store(&manifest, stream_of(&data, 4), &AbortSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer { transient: false, .. }));
        assert_eq!(store.aborted_uploads(), 1);
        assert_eq!(store.open_uploads(), 0);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_parts(1, false);
        let backend = backend(&store);

        let manifest = manifest_for("machine", b"abc", 4, 0);
        backend
            .store(&manifest, stream_of(b"abc", 4), &AbortSignal::new())
            .await
            .unwrap_err();
        assert_eq!(store.part_attempts(), 1);
        assert_eq!(store.aborted_uploads(), 1);
    }

    #[tokio::test]
    async fn test_too_many_parts_rejected_before_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = backend(&store);

        let data = vec![0u8; 40_000];
        let manifest = manifest_for("machine", &data, 4, 0);
        assert_eq!(manifest.total_chunks, 10_001);
        let err = backend
            .store(&manifest, stream_of(&data, 4), &AbortSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer { transient: false, .. }));
        assert!(err.to_string().contains("10001 parts"));
        assert_eq!(store.part_attempts(), 0);
        assert_eq!(store.aborted_uploads(), 0);
        assert_eq!(store.open_uploads(), 0);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_multipart() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = backend(&store);
        let abort = AbortSignal::new();

        let data = b"0123456789".to_vec();
        let manifest = manifest_for("machine", &data, 4, 0);
        let trigger = abort.clone();
        let chunks = stream_of(&data, 4)
            .enumerate()
            .map(move |(i, chunk)| {
                if i == 1 {
                    trigger.abort();
                }
                chunk
            })
            .boxed();

        let err = backend.store(&manifest, chunks, &abort).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.aborted_uploads(), 1);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_skips_partial() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = backend(&store);

        let mut manifests = Vec::new();
        for minutes in 0..5 {
            let data = format!("run {}", minutes).into_bytes();
            let manifest = manifest_for("machine", &data, 4, minutes);
            backend
                .store(&manifest, stream_of(&data, 4), &AbortSignal::new())
                .await
                .unwrap();
            manifests.push(manifest);
        }

        // Old data object whose manifest never landed
        let (partial_id, _) = crate::test_support::run_at(-60);
        let partial_key = format!("backup/machine/{}/machine.sbox", partial_id);
        store.insert(&partial_key, b"partial".to_vec());

        let report = backend.prune("machine", 3).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(
            report.deleted,
            vec![manifests[1].run_id.clone(), manifests[0].run_id.clone()]
        );

        let listing = backend.list("machine").await.unwrap();
        let remaining: Vec<RunId> = listing.complete.iter().map(|s| s.run_id.clone()).collect();
        let expected: Vec<RunId> = manifests[2..].iter().rev().map(|m| m.run_id.clone()).collect();
        assert_eq!(remaining, expected);
        assert_eq!(listing.partial.len(), 1);
        assert!(store.object(&partial_key).is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_manifest() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = backend(&store);

        for minutes in 0..2 {
            let manifest = manifest_for("machine", b"x", 4, minutes);
            backend
                .store(&manifest, stream_of(b"x", 4), &AbortSignal::new())
                .await
                .unwrap();
        }

        store.fail_deletes(true);
        let report = backend.prune("machine", 1).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.deleted.is_empty());
        assert_eq!(backend.list("machine").await.unwrap().complete.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_failure_aborts_upload_mock() {
        let mut client = MockObjectStoreClient::new();
        client
            .expect_create_multipart()
            .times(1)
            .returning(|_| Ok("upload-1".to_string()));
        client
            .expect_upload_part()
            .times(1)
            .returning(|_, _, part_number, _| {
                Ok(UploadedPart {
                    part_number,
                    etag: "etag-1".to_string(),
                })
            });
        client
            .expect_complete_multipart()
            .times(1)
            .returning(|_, _, _| Err(Error::permanent("s3", "InvalidPart")));
        client
            .expect_abort_multipart()
            .withf(|key, upload_id| {
                key.ends_with("/vault.sbox") && upload_id.to_string() == "upload-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_put_object().never();

        let backend = ObjectStoreBackend::new("s3", Arc::new(client), "", quick_retry());
        let manifest = manifest_for("vault", b"abc", 4, 0);
        let err = backend
            .store(&manifest, stream_of(b"abc", 4), &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPart"));
    }
}
