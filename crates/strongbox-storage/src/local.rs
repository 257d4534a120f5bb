//! Local filesystem backend
//!
//! Layout: `<base>/<model>/<run-id>/{<model>.sbox, manifest.json}`. Chunks are
//! appended in order to `<model>.sbox.partial`, which is renamed once synced;
//! the manifest is written through a temp file and renamed last.

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use strongbox_core::types::{
    LocalStorageConfig, Manifest, PartialBackupSet, RunId, StoredBackupSet, MANIFEST_FILENAME,
};
use strongbox_core::{AbortSignal, Error, Result};

use crate::retention::{plan_retention, sort_newest_first};
use crate::{ChunkStream, PruneReport, SequenceGuard, SetListing, StorageBackend};

const LOCK_FILENAME: &str = ".lock";
const DELETING_SUFFIX: &str = ".deleting";

/// Stores sets as plain files under a base directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    base: PathBuf,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    pub fn from_config(config: &LocalStorageConfig) -> Self {
        Self::new(
            config.name.clone().unwrap_or_else(|| "local".to_string()),
            &config.path,
        )
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn model_dir(&self, model: &str) -> PathBuf {
        self.base.join(model)
    }

    /// Directory of one set
    pub fn set_dir(&self, model: &str, run_id: &RunId) -> PathBuf {
        self.model_dir(model).join(run_id.as_str())
    }

    /// Cross-process lock on a model directory, released when the file drops
    async fn lock_model(&self, model: &str) -> Result<std::fs::File> {
        let dir = self.model_dir(model);
        let backend = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            std::fs::create_dir_all(&dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(dir.join(LOCK_FILENAME))?;
            file.lock_exclusive().map_err(|e| {
                Error::permanent(
                    backend,
                    format!("failed to lock {}: {}", dir.display(), e),
                )
            })?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::permanent(&self.name, format!("lock task failed: {}", e)))?
    }

    fn io_err(&self, action: &str, path: &Path, e: std::io::Error) -> Error {
        Error::permanent(
            &self.name,
            format!("failed to {} {}: {}", action, path.display(), e),
        )
    }

    async fn write_set(
        &self,
        manifest: &Manifest,
        set_dir: &Path,
        mut chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<()> {
        fs::create_dir_all(set_dir)
            .await
            .map_err(|e| self.io_err("create", set_dir, e))?;

        let data_path = set_dir.join(&manifest.object);
        let partial_path = set_dir.join(format!("{}.partial", manifest.object));
        let mut file = fs::File::create(&partial_path)
            .await
            .map_err(|e| self.io_err("create", &partial_path, e))?;

        let mut guard = SequenceGuard::new();
        while let Some(chunk) = chunks.next().await {
            abort.check()?;
            let chunk = chunk?;
            guard.accept(&chunk)?;
            file.write_all(&chunk.payload)
                .await
                .map_err(|e| self.io_err("write", &partial_path, e))?;
            debug!(
                backend = %self.name,
                seq = chunk.sequence_number,
                bytes = chunk.payload.len(),
                "Wrote chunk"
            );
        }
        guard.finish(manifest)?;

        file.sync_all()
            .await
            .map_err(|e| self.io_err("sync", &partial_path, e))?;
        drop(file);
        fs::rename(&partial_path, &data_path)
            .await
            .map_err(|e| self.io_err("rename", &partial_path, e))?;

        abort.check()?;
        write_atomic(&set_dir.join(MANIFEST_FILENAME), manifest.to_json()?.as_bytes())
            .await
            .map_err(|e| self.io_err("write manifest in", set_dir, e))?;
        Ok(())
    }

    /// Remove half-deleted sets left by an interrupted prune
    async fn sweep_deleting(&self, model_dir: &Path) {
        let Ok(mut entries) = fs::read_dir(model_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(DELETING_SUFFIX) {
                match fs::remove_dir_all(entry.path()).await {
                    Ok(()) => info!("Removed leftover {}", entry.path().display()),
                    Err(e) => warn!(
                        "Could not remove leftover {}: {}",
                        entry.path().display(),
                        e
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn store(
        &self,
        manifest: &Manifest,
        chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<StoredBackupSet> {
        abort.check()?;
        let model = &manifest.model_name;
        let _lock = self.lock_model(model).await?;
        let set_dir = self.set_dir(model, &manifest.run_id);

        info!(backend = %self.name, "Storing {} to {}", model, set_dir.display());
        if let Err(e) = self.write_set(manifest, &set_dir, chunks, abort).await {
            if let Err(cleanup) = fs::remove_dir_all(&set_dir).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Could not remove incomplete set {}: {}",
                        set_dir.display(),
                        cleanup
                    );
                }
            }
            return Err(e);
        }

        info!(
            backend = %self.name,
            "Stored {} ({} bytes in {} chunks)",
            set_dir.display(),
            manifest.total_bytes,
            manifest.total_chunks
        );
        Ok(StoredBackupSet {
            model_name: model.clone(),
            run_id: manifest.run_id.clone(),
            location: set_dir.display().to_string(),
            manifest: manifest.clone(),
        })
    }

    async fn list(&self, model: &str) -> Result<SetListing> {
        let model_dir = self.model_dir(model);
        let mut listing = SetListing::default();

        let mut entries = match fs::read_dir(&model_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(self.io_err("read", &model_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_err("read", &model_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(run_id) = RunId::parse(&name) else {
                continue;
            };
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let location = entry.path().display().to_string();
            let manifest_path = entry.path().join(MANIFEST_FILENAME);
            match fs::read_to_string(&manifest_path).await {
                Ok(json) => match Manifest::from_json(&json) {
                    Ok(manifest) => listing.complete.push(StoredBackupSet {
                        model_name: model.to_string(),
                        run_id,
                        location,
                        manifest,
                    }),
                    Err(e) => {
                        warn!("Ignoring unreadable manifest {}: {}", manifest_path.display(), e);
                        listing.partial.push(PartialBackupSet {
                            model_name: model.to_string(),
                            run_id,
                            location,
                        });
                    }
                },
                Err(_) => listing.partial.push(PartialBackupSet {
                    model_name: model.to_string(),
                    run_id,
                    location,
                }),
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
        let model_dir = self.model_dir(model);
        let _lock = self.lock_model(model).await?;

        self.sweep_deleting(&model_dir).await;

        let listing = self.list(model).await?;
        let (kept, expired) = plan_retention(&listing.complete, keep);
        let mut report = PruneReport {
            kept,
            ..Default::default()
        };

        for run_id in expired {
            let set_dir = model_dir.join(run_id.as_str());
            let hidden = model_dir.join(format!(".{}{}", run_id, DELETING_SUFFIX));

            // The rename takes the whole set out of view at once.
            if let Err(e) = fs::rename(&set_dir, &hidden).await {
                warn!("Keeping {}: could not detach it: {}", set_dir.display(), e);
                report.failed.push((run_id, e.to_string()));
                continue;
            }
            if let Err(e) = fs::remove_dir_all(&hidden).await {
                warn!(
                    "Detached {} but could not remove it, will retry on next prune: {}",
                    hidden.display(),
                    e
                );
            }
            info!(backend = %self.name, "Pruned {}/{}", model, run_id);
            report.deleted.push(run_id);
        }

        Ok(report)
    }
}

/// Write `contents` to a sibling temp file, sync it and rename it over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}
