//! Drives one backup model end to end
//!
//! ```text
//! Idle → PreHook → Enumerating → Piping → Uploading → Pruning → Done
//!                        (any live state) → Failed
//! ```
//!
//! The sealed stream is spooled once in the run's work dir; every configured
//! backend then uploads it concurrently from its own chunk stream. A failing
//! backend does not stop the others, but the run only succeeds when every
//! backend stored the set. Retention runs per backend after its upload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

use strongbox_core::types::{
    ChecksumInfo, Manifest, ModelPolicy, RetryPolicy, RunId, StorageConfig,
};
use strongbox_core::{AbortSignal, Error, Result};
use strongbox_storage::{build_backend, LockRegistry, PruneReport, SetListing, StorageBackend};

use crate::archive::BuildSummary;
use crate::hooks::{run_hooks, HookOutcome};
use crate::pipeline::{run_pipeline, PipelineOutput};
use crate::sources::{
    enumerate_all, EnumerationContext, FsEnumerator, SkippedSource, SourceEnumerator,
};
use crate::state::{RunState, RunStateMachine};
use crate::workdir::WorkDir;

/// Turns storage configuration into live backends
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn backend(
        &self,
        config: &StorageConfig,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn StorageBackend>>;
}

/// Builds the backend each storage entry describes
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredBackends;

#[async_trait]
impl BackendProvider for ConfiguredBackends {
    async fn backend(
        &self,
        config: &StorageConfig,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn StorageBackend>> {
        build_backend(config, retry).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Stored,
    Failed,
}

/// Outcome of one backend branch
#[derive(Debug)]
pub struct BackendReport {
    pub name: String,
    pub kind: &'static str,
    pub status: BackendStatus,
    /// Where the set landed
    pub location: Option<String>,
    pub chunks: u64,
    pub error: Option<Error>,
    pub prune: Option<PruneReport>,
    pub prune_error: Option<Error>,
}

impl BackendReport {
    fn new(name: String, kind: &'static str) -> Self {
        Self {
            name,
            kind,
            status: BackendStatus::Failed,
            location: None,
            chunks: 0,
            error: None,
            prune: None,
            prune_error: None,
        }
    }

    fn failed(mut self, err: Error) -> Self {
        self.status = BackendStatus::Failed;
        self.error = Some(err);
        self
    }
}

/// Outcome of one model run
#[derive(Debug)]
pub struct RunReport {
    pub model: String,
    pub run_id: RunId,
    pub state: RunState,
    /// State the run was in when it failed
    pub failed_in: Option<RunState>,
    /// Run-level failure; backend failures are in `backends`
    pub error: Option<Error>,
    pub hooks: Vec<(String, HookOutcome)>,
    pub skipped: Vec<SkippedSource>,
    pub archive: Option<BuildSummary>,
    /// Size of the sealed stream
    pub bytes: u64,
    pub backends: Vec<BackendReport>,
}

impl RunReport {
    fn new(model: &str, run_id: RunId) -> Self {
        Self {
            model: model.to_string(),
            run_id,
            state: RunState::Idle,
            failed_in: None,
            error: None,
            hooks: Vec::new(),
            skipped: Vec::new(),
            archive: None,
            bytes: 0,
            backends: Vec::new(),
        }
    }

    /// Every mandatory stage and every backend succeeded
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
            && self.error.is_none()
            && self
                .backends
                .iter()
                .all(|b| b.status == BackendStatus::Stored)
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::pipeline(format!("worker task failed: {}", e))
}

/// Runs backup models
pub struct Orchestrator {
    locks: LockRegistry,
    backends: Arc<dyn BackendProvider>,
    enumerator: Arc<dyn SourceEnumerator>,
    work_root: Option<PathBuf>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            locks: LockRegistry::new(),
            backends: Arc::new(ConfiguredBackends),
            enumerator: Arc::new(FsEnumerator),
            work_root: None,
        }
    }

    pub fn with_backends(mut self, backends: Arc<dyn BackendProvider>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn SourceEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    /// Create work dirs under `root` instead of the system temp dir
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn with_locks(mut self, locks: LockRegistry) -> Self {
        self.locks = locks;
        self
    }

    /// Run several models, one after another or all at once
    pub async fn run_all(
        &self,
        policies: &[ModelPolicy],
        parallel: bool,
        abort: &AbortSignal,
    ) -> Vec<RunReport> {
        if parallel {
            return join_all(policies.iter().map(|policy| self.run(policy, abort))).await;
        }
        let mut reports = Vec::with_capacity(policies.len());
        for policy in policies {
            reports.push(self.run(policy, abort).await);
        }
        reports
    }

    /// Run one model to completion; never panics on a failed stage
    pub async fn run(&self, policy: &ModelPolicy, abort: &AbortSignal) -> RunReport {
        let created_at = Utc::now();
        let run_id = RunId::generate(created_at);
        let mut report = RunReport::new(&policy.name, run_id.clone());
        let mut machine = RunStateMachine::new();

        let span = info_span!("run", model = %policy.name, run = %run_id);
        let outcome = self
            .execute(policy, created_at, abort, &mut machine, &mut report)
            .instrument(span)
            .await;

        if let Err(e) = outcome {
            machine.fail();
            error!(
                model = %policy.name,
                "Run {} failed while {}: {}",
                run_id,
                machine.failed_in().unwrap_or(RunState::Idle),
                e
            );
            report.error = Some(e);
        }
        report.state = machine.state();
        report.failed_in = machine.failed_in();
        report
    }

    async fn execute(
        &self,
        policy: &ModelPolicy,
        created_at: DateTime<Utc>,
        abort: &AbortSignal,
        machine: &mut RunStateMachine,
        report: &mut RunReport,
    ) -> Result<()> {
        abort.check()?;
        let workdir = match &self.work_root {
            Some(root) => WorkDir::create_in(root, &policy.name)?,
            None => WorkDir::create(&policy.name)?,
        };
        info!("Starting backup of {}", policy.name);

        machine.transition(RunState::PreHook)?;
        report.hooks = run_hooks(&policy.hooks, workdir.path(), abort).await?;

        machine.transition(RunState::Enumerating)?;
        abort.check()?;
        let enumerator = Arc::clone(&self.enumerator);
        let specs = policy.sources.clone();
        let ctx = EnumerationContext::new(workdir.path());
        let enumeration = tokio::task::spawn_blocking(move || {
            enumerate_all(enumerator.as_ref(), &specs, &ctx)
        })
        .await
        .map_err(join_error)??;
        report.skipped = enumeration.skipped;
        info!("{} entries to archive", enumeration.entries.len());

        machine.transition(RunState::Piping)?;
        let entries = enumeration.entries;
        let descriptor = policy.pipeline.clone();
        let keys = policy.key_store.clone();
        let spool_path = workdir.spool_path();
        let pipeline_abort = abort.clone();
        let output = tokio::task::spawn_blocking(move || {
            run_pipeline(entries, &descriptor, &keys, &spool_path, &pipeline_abort)
        })
        .await
        .map_err(join_error)??;
        report.archive = Some(output.summary.clone());
        report.bytes = output.spool.bytes;

        machine.transition(RunState::Uploading)?;
        abort.check()?;
        let run_id = report.run_id.clone();
        let uploads = join_all(
            policy
                .storage
                .iter()
                .map(|storage| self.upload(policy, storage, &output, created_at, &run_id, abort)),
        )
        .await;

        let mut stored = Vec::new();
        for (index, (backend_report, backend)) in uploads.into_iter().enumerate() {
            if let (Some(backend), Some(keep)) = (backend, policy.storage[index].keep()) {
                stored.push((index, backend, keep));
            }
            report.backends.push(backend_report);
        }
        abort.check()?;

        if report
            .backends
            .iter()
            .all(|b| b.status == BackendStatus::Failed)
        {
            error!("No backend stored {}/{}", policy.name, run_id);
            machine.fail();
            workdir.release();
            return Ok(());
        }

        machine.transition(RunState::Pruning)?;
        let prunes = join_all(stored.iter().map(|(index, backend, keep)| async move {
            (*index, self.prune_backend(&policy.name, backend, *keep).await)
        }))
        .await;
        for (index, result) in prunes {
            let entry = &mut report.backends[index];
            match result {
                Ok(pruned) => {
                    for (run, reason) in &pruned.failed {
                        warn!(backend = %entry.name, "Could not prune {}: {}", run, reason);
                    }
                    entry.prune = Some(pruned);
                }
                Err(e) => {
                    warn!(backend = %entry.name, "Prune failed: {}", e);
                    entry.prune_error = Some(e);
                }
            }
        }

        machine.transition(RunState::Done)?;
        workdir.release();
        info!("Backup of {} finished as {}", policy.name, run_id);
        Ok(())
    }

    /// Upload the spooled stream to one backend
    async fn upload(
        &self,
        policy: &ModelPolicy,
        storage: &StorageConfig,
        output: &PipelineOutput,
        created_at: DateTime<Utc>,
        run_id: &RunId,
        abort: &AbortSignal,
    ) -> (BackendReport, Option<Arc<dyn StorageBackend>>) {
        let name = storage.name();
        let report = BackendReport::new(name.clone(), storage.kind());

        let branch = async {
            let backend = match self.backends.backend(storage, &policy.retry).await {
                Ok(backend) => backend,
                Err(e) => {
                    error!("Could not set up backend: {}", e);
                    return (report.failed(e), None);
                }
            };

            let chunk_size = storage.chunk_size(policy.pipeline.chunk_size_bytes);
            let manifest = Manifest::new(
                &policy.name,
                run_id.clone(),
                created_at,
                output.spool.bytes,
                chunk_size,
                ChecksumInfo::sha256(&output.spool.checksum),
            )
            .with_backend(&name)
            .with_compression_level(policy.pipeline.compression_level)
            .with_recipients(output.recipients.clone())
            .with_entries(output.summary.entries);

            let _guard = self.locks.acquire(&policy.name, &name).await;
            let stored = match output.spool.chunks(chunk_size) {
                Ok(chunks) => backend.store(&manifest, chunks, abort).await,
                Err(e) => Err(e),
            };

            match stored {
                Ok(set) => {
                    info!(
                        "Stored {} chunks ({} bytes) at {}",
                        manifest.total_chunks, manifest.total_bytes, set.location
                    );
                    let mut report = report;
                    report.status = BackendStatus::Stored;
                    report.location = Some(set.location);
                    report.chunks = manifest.total_chunks;
                    (report, Some(backend))
                }
                Err(e) => {
                    error!("Upload failed: {}", e);
                    (report.failed(e), None)
                }
            }
        };

        branch
            .instrument(info_span!("backend", name = %name))
            .await
    }

    async fn prune_backend(
        &self,
        model: &str,
        backend: &Arc<dyn StorageBackend>,
        keep: u32,
    ) -> Result<PruneReport> {
        let _guard = self.locks.acquire(model, backend.name()).await;
        backend.prune(model, keep).await
    }

    /// Apply retention at every backend of a model that has `keep` set
    pub async fn prune(&self, policy: &ModelPolicy) -> Vec<(String, Result<PruneReport>)> {
        let branches = policy.storage.iter().filter_map(|storage| {
            let keep = storage.keep()?;
            Some(async move {
                let name = storage.name();
                let result = match self.backends.backend(storage, &policy.retry).await {
                    Ok(backend) => self.prune_backend(&policy.name, &backend, keep).await,
                    Err(e) => Err(e),
                };
                (name, result)
            })
        });
        join_all(branches).await
    }

    /// List stored sets at every backend of a model
    pub async fn list(&self, policy: &ModelPolicy) -> Vec<(String, Result<SetListing>)> {
        let branches = policy.storage.iter().map(|storage| async move {
            let name = storage.name();
            let result = match self.backends.backend(storage, &policy.retry).await {
                Ok(backend) => backend.list(&policy.name).await,
                Err(e) => Err(e),
            };
            (name, result)
        });
        join_all(branches).await
    }
}
