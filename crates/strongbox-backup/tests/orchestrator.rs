//! End-to-end runs against the local backend and the in-memory object store

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Barrier;

use strongbox_backup::encryption::{generate_identity, load_identities, write_identity_file};
use strongbox_backup::{
    extract_set, BackendProvider, BackendStatus, ConfiguredBackends, Orchestrator, RunState,
};
use strongbox_core::types::{
    HookSpec, KeyStore, LocalStorageConfig, Manifest, ModelPolicy, PathSource,
    PipelineDescriptor, RetryPolicy, RetryStrategy, S3StorageConfig, SourceSpec, StorageConfig,
    StoredBackupSet, MANIFEST_FILENAME,
};
use strongbox_core::{AbortSignal, Error, Result};
use strongbox_storage::{
    ChunkStream, MemoryObjectStore, ObjectStoreBackend, PruneReport, SetListing, StorageBackend,
};

const MODEL: &str = "documents";

/// Serves prepared backends by name, building the rest from config
struct TestBackends {
    prepared: HashMap<String, Arc<dyn StorageBackend>>,
}

#[async_trait]
impl BackendProvider for TestBackends {
    async fn backend(
        &self,
        config: &StorageConfig,
        retry: &RetryPolicy,
    ) -> Result<Arc<dyn StorageBackend>> {
        match self.prepared.get(&config.name()) {
            Some(backend) => Ok(Arc::clone(backend)),
            None => ConfiguredBackends.backend(config, retry).await,
        }
    }
}

/// Holds every store at a shared barrier until all backends have started
struct RendezvousBackend {
    inner: Arc<dyn StorageBackend>,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl StorageBackend for RendezvousBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn store(
        &self,
        manifest: &Manifest,
        chunks: ChunkStream,
        abort: &AbortSignal,
    ) -> Result<StoredBackupSet> {
        tokio::time::timeout(Duration::from_secs(5), self.barrier.wait())
            .await
            .map_err(|_| Error::permanent(self.name(), "other backends never started"))?;
        self.inner.store(manifest, chunks, abort).await
    }

    async fn list(&self, model: &str) -> Result<SetListing> {
        self.inner.list(model).await
    }

    async fn prune(&self, model: &str, keep: u32) -> Result<PruneReport> {
        self.inner.prune(model, keep).await
    }
}

struct Fixture {
    _root: TempDir,
    source: std::path::PathBuf,
    local: std::path::PathBuf,
    work: std::path::PathBuf,
    store: Arc<MemoryObjectStore>,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        std::fs::create_dir_all(source.join("taxes")).unwrap();
        std::fs::write(source.join("taxes/2025.pdf"), vec![42u8; 50_000]).unwrap();
        std::fs::write(source.join("notes.txt"), b"remember the milk\n").unwrap();

        Self {
            local: root.path().join("backups"),
            work: root.path().join("work"),
            source,
            store: Arc::new(MemoryObjectStore::new()),
            _root: root,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            strategy: RetryStrategy::FixedDelay,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        }
    }

    fn policy(&self, recipients: Vec<String>, keys: KeyStore) -> ModelPolicy {
        ModelPolicy {
            name: MODEL.to_string(),
            description: None,
            hooks: vec![],
            sources: vec![SourceSpec::Path(PathSource {
                path: self.source.display().to_string(),
                root: Some(self.source.display().to_string()),
                archive: Some("docs".into()),
                exclude: vec![],
                mandatory: true,
            })],
            pipeline: PipelineDescriptor {
                compression_level: 9,
                encryption_recipients: recipients,
                chunk_size_bytes: 4096,
            },
            storage: vec![
                StorageConfig::Local(LocalStorageConfig {
                    name: Some("disk".into()),
                    path: self.local.display().to_string(),
                    keep: Some(3),
                }),
                StorageConfig::S3(S3StorageConfig {
                    name: Some("cloud".into()),
                    bucket: "backups".into(),
                    region: "us-east-1".into(),
                    endpoint: None,
                    prefix: "backup".into(),
                    access_key_id: None,
                    secret_access_key: None,
                    chunk_size_mb: None,
                    keep: Some(3),
                }),
            ],
            retry: Self::retry(),
            key_store: keys,
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let cloud: Arc<dyn StorageBackend> = Arc::new(ObjectStoreBackend::new(
            "cloud",
            self.store.clone(),
            "backup",
            Self::retry(),
        ));
        Orchestrator::new()
            .with_backends(Arc::new(TestBackends {
                prepared: HashMap::from([("cloud".to_string(), cloud)]),
            }))
            .with_work_root(&self.work)
    }

    fn manifests_in_store(&self) -> usize {
        self.store
            .keys()
            .iter()
            .filter(|k| k.ends_with(MANIFEST_FILENAME))
            .count()
    }

    fn work_is_empty(&self) -> bool {
        std::fs::read_dir(&self.work)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

fn set_dir(local: &Path, run_id: &str) -> std::path::PathBuf {
    local.join(MODEL).join(run_id)
}

#[tokio::test]
async fn test_run_stores_at_every_backend_and_extracts() {
    let fx = Fixture::new();
    let key_file = fx.work.parent().unwrap().join("strongbox.key");
    let public_key = write_identity_file(&key_file, false).unwrap();
    let keys = KeyStore::new(BTreeMap::from([("home".to_string(), public_key)]));

    let report = fx
        .orchestrator()
        .run(&fx.policy(vec!["home".into()], keys), &AbortSignal::new())
        .await;

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.backends.len(), 2);
    assert!(report
        .backends
        .iter()
        .all(|b| b.status == BackendStatus::Stored));
    assert_eq!(fx.manifests_in_store(), 1);
    assert!(fx.work_is_empty());

    let out = tempfile::tempdir().unwrap();
    let identities = load_identities(&key_file).unwrap();
    let extracted = extract_set(
        &set_dir(&fx.local, report.run_id.as_str()),
        &identities,
        out.path(),
    )
    .unwrap();
    assert_eq!(extracted.entries, report.archive.as_ref().unwrap().entries);
    assert_eq!(
        std::fs::read(out.path().join("docs/taxes/2025.pdf")).unwrap(),
        vec![42u8; 50_000]
    );
    assert_eq!(
        std::fs::read_to_string(out.path().join("docs/notes.txt")).unwrap(),
        "remember the milk\n"
    );
}

#[tokio::test]
async fn test_extract_with_wrong_identity_fails() {
    let fx = Fixture::new();
    let owner = generate_identity();
    let report = fx
        .orchestrator()
        .run(
            &fx.policy(vec![owner.to_public().to_string()], KeyStore::default()),
            &AbortSignal::new(),
        )
        .await;
    assert!(report.is_success());

    let out = tempfile::tempdir().unwrap();
    let err = extract_set(
        &set_dir(&fx.local, report.run_id.as_str()),
        &[generate_identity()],
        out.path(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Pipeline { .. }));
}

#[tokio::test]
async fn test_keep_three_of_five_runs() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    let policy = fx.policy(vec![], KeyStore::default());

    let mut run_ids = Vec::new();
    for _ in 0..5 {
        let report = orchestrator.run(&policy, &AbortSignal::new()).await;
        assert!(report.is_success(), "{:?}", report);
        run_ids.push(report.run_id);
    }

    let newest: Vec<_> = run_ids.iter().rev().take(3).cloned().collect();
    for (name, listing) in orchestrator.list(&policy).await {
        let listing = listing.unwrap();
        let kept: Vec<_> = listing.complete.iter().map(|s| s.run_id.clone()).collect();
        assert_eq!(kept, newest, "backend {}", name);
        assert!(listing.partial.is_empty());
    }
}

#[tokio::test]
async fn test_missing_mandatory_source_contacts_no_backend() {
    let fx = Fixture::new();
    let mut policy = fx.policy(vec![], KeyStore::default());
    policy.sources.push(SourceSpec::Path(PathSource {
        path: fx.source.join("vault.kdbx").display().to_string(),
        root: None,
        archive: None,
        exclude: vec![],
        mandatory: true,
    }));

    let report = fx.orchestrator().run(&policy, &AbortSignal::new()).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failed_in, Some(RunState::Enumerating));
    assert!(matches!(
        report.error,
        Some(Error::MandatorySourceMissing { .. })
    ));
    assert!(report.backends.is_empty());
    assert!(fx.store.keys().is_empty());
    assert!(!fx.local.join(MODEL).exists());
    assert!(fx.work_is_empty());
}

#[tokio::test]
async fn test_transient_failures_within_budget_succeed() {
    let fx = Fixture::new();
    fx.store.fail_next_parts(2, true);

    let policy = fx.policy(vec![], KeyStore::default());
    let orchestrator = fx.orchestrator();
    let report = orchestrator.run(&policy, &AbortSignal::new()).await;

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(fx.manifests_in_store(), 1);
    assert_eq!(fx.store.open_uploads(), 0);

    let cloud = orchestrator
        .list(&policy)
        .await
        .into_iter()
        .find(|(name, _)| name == "cloud")
        .unwrap()
        .1
        .unwrap();
    assert_eq!(cloud.complete.len(), 1);
}

#[tokio::test]
async fn test_permanent_failure_leaves_other_backends_complete() {
    let fx = Fixture::new();
    fx.store.fail_next_parts(1, false);

    let report = fx
        .orchestrator()
        .run(&fx.policy(vec![], KeyStore::default()), &AbortSignal::new())
        .await;

    assert!(!report.is_success());
    let disk = report.backends.iter().find(|b| b.name == "disk").unwrap();
    let cloud = report.backends.iter().find(|b| b.name == "cloud").unwrap();
    assert_eq!(disk.status, BackendStatus::Stored);
    assert_eq!(cloud.status, BackendStatus::Failed);
    assert!(cloud.error.as_ref().is_some_and(|e| !e.is_transient()));

    assert_eq!(fx.store.aborted_uploads(), 1);
    assert_eq!(fx.manifests_in_store(), 0);
    assert!(set_dir(&fx.local, report.run_id.as_str())
        .join(MANIFEST_FILENAME)
        .exists());
    assert!(fx.work_is_empty());
}

#[tokio::test]
async fn test_backend_uploads_overlap() {
    let fx = Fixture::new();
    let policy = fx.policy(vec![], KeyStore::default());
    let barrier = Arc::new(Barrier::new(policy.storage.len()));

    let disk = ConfiguredBackends
        .backend(&policy.storage[0], &policy.retry)
        .await
        .unwrap();
    let cloud: Arc<dyn StorageBackend> = Arc::new(ObjectStoreBackend::new(
        "cloud",
        fx.store.clone(),
        "backup",
        Fixture::retry(),
    ));
    let prepared = [("disk", disk), ("cloud", cloud)]
        .into_iter()
        .map(|(name, inner)| {
            let backend: Arc<dyn StorageBackend> = Arc::new(RendezvousBackend {
                inner,
                barrier: barrier.clone(),
            });
            (name.to_string(), backend)
        })
        .collect();
    let orchestrator = Orchestrator::new()
        .with_backends(Arc::new(TestBackends { prepared }))
        .with_work_root(&fx.work);

    let report = orchestrator.run(&policy, &AbortSignal::new()).await;

    assert!(report.is_success(), "{:?}", report.backends);
    assert!(report
        .backends
        .iter()
        .all(|b| b.status == BackendStatus::Stored));
    assert_eq!(fx.manifests_in_store(), 1);
}

#[tokio::test]
async fn test_failing_mandatory_hook_touches_no_storage() {
    let fx = Fixture::new();
    let mut policy = fx.policy(vec![], KeyStore::default());
    policy.hooks = vec![HookSpec {
        name: "snapshot".into(),
        run: "exit 7".into(),
        requires: vec![],
        mandatory: true,
        timeout_secs: None,
    }];

    let report = fx.orchestrator().run(&policy, &AbortSignal::new()).await;

    assert_eq!(report.failed_in, Some(RunState::PreHook));
    assert!(matches!(report.error, Some(Error::HookFailed { .. })));
    assert!(fx.store.keys().is_empty());
    assert!(!fx.local.join(MODEL).exists());
}

#[tokio::test]
async fn test_hook_output_is_archived_from_workdir() {
    let fx = Fixture::new();
    let mut policy = fx.policy(vec![], KeyStore::default());
    policy.hooks = vec![HookSpec {
        name: "listing".into(),
        run: "echo 'git ripgrep' > \"$STRONGBOX_WORKDIR/packages.txt\"".into(),
        requires: vec![],
        mandatory: true,
        timeout_secs: None,
    }];
    policy.sources.push(SourceSpec::Path(PathSource {
        path: "{workdir}/packages.txt".into(),
        root: Some("{workdir}".into()),
        archive: Some("installation".into()),
        exclude: vec![],
        mandatory: true,
    }));

    let report = fx.orchestrator().run(&policy, &AbortSignal::new()).await;
    assert!(report.is_success(), "{:?}", report);

    let out = tempfile::tempdir().unwrap();
    extract_set(&set_dir(&fx.local, report.run_id.as_str()), &[], out.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(out.path().join("installation/packages.txt")).unwrap(),
        "git ripgrep\n"
    );
    assert!(fx.work_is_empty());
}

#[tokio::test]
async fn test_aborted_run_is_cancelled() {
    let fx = Fixture::new();
    let abort = AbortSignal::new();
    abort.abort();

    let report = fx
        .orchestrator()
        .run(&fx.policy(vec![], KeyStore::default()), &abort)
        .await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(report.error, Some(Error::Cancelled)));
    assert!(fx.store.keys().is_empty());
}

#[tokio::test]
async fn test_prune_without_backup() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    let mut policy = fx.policy(vec![], KeyStore::default());
    for _ in 0..3 {
        assert!(orchestrator.run(&policy, &AbortSignal::new()).await.is_success());
    }

    for storage in &mut policy.storage {
        match storage {
            StorageConfig::Local(c) => c.keep = Some(1),
            StorageConfig::S3(c) => c.keep = Some(1),
        }
    }
    let results = orchestrator.prune(&policy).await;
    assert_eq!(results.len(), 2);
    for (name, result) in results {
        let report = result.unwrap();
        assert_eq!(report.kept.len(), 1, "backend {}", name);
        assert_eq!(report.deleted.len(), 2, "backend {}", name);
    }
}
