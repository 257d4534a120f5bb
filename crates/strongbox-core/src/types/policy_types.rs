//! Backup model policy types
//!
//! These types appear twice: as the serde shape of `strongbox.yaml` and, once
//! merged with the `defaults` block, as the resolved [`ModelPolicy`] a run is
//! driven by.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::RetryPolicy;

/// Default gzip level when neither the model nor the defaults set one
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default chunk size in MiB
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 10;

pub const MIB: u64 = 1024 * 1024;

/// Smallest part size accepted by S3-compatible multipart uploads
pub const MIN_OBJECT_STORE_PART_SIZE: u64 = 5 * MIB;

/// Largest part size accepted by S3-compatible multipart uploads
pub const MAX_OBJECT_STORE_PART_SIZE: u64 = 5 * 1024 * MIB;

/// Largest pipeline chunk; each backend holds one chunk in memory
pub const MAX_CHUNK_SIZE: u64 = 1024 * MIB;

/// Most parts one multipart upload may have
pub const MAX_OBJECT_STORE_PARTS: u64 = 10_000;

/// A single thing to archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceSpec {
    /// A file or a directory tree
    Path(PathSource),
    /// Files matching a glob pattern
    Glob(GlobSource),
    /// Captured standard output of a program
    Command(CommandSource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathSource {
    /// File or directory to archive; a relative path is resolved under
    /// `root` when one is set, else under the working directory
    pub path: String,

    /// Base for relative paths; logical paths are recorded relative to it
    #[serde(default)]
    pub root: Option<String>,

    /// Named archive group the entries are placed under
    #[serde(default)]
    pub archive: Option<String>,

    /// Glob patterns (relative to `path`) to leave out
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobSource {
    pub pattern: String,

    /// Directory the pattern is evaluated in; also the logical path root
    #[serde(default)]
    pub root: Option<String>,

    #[serde(default)]
    pub archive: Option<String>,

    /// Fail the run when nothing matches
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommandSource {
    /// Logical path of the captured output inside the archive
    pub name: String,

    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Tool that must be on PATH; defaults to `program`
    #[serde(default)]
    pub requires: Option<String>,

    #[serde(default)]
    pub archive: Option<String>,

    #[serde(default)]
    pub mandatory: bool,
}

impl SourceSpec {
    pub fn is_mandatory(&self) -> bool {
        match self {
            Self::Path(s) => s.mandatory,
            Self::Glob(s) => s.mandatory,
            Self::Command(s) => s.mandatory,
        }
    }

    /// Short human-readable form used in logs
    pub fn describe(&self) -> String {
        match self {
            Self::Path(s) => format!("path {}", s.path),
            Self::Glob(s) => match &s.root {
                Some(root) => format!("glob {} in {}", s.pattern, root),
                None => format!("glob {}", s.pattern),
            },
            Self::Command(s) => format!("command {} {}", s.program, s.args.join(" ")),
        }
    }
}

/// A command run before the sources are enumerated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookSpec {
    pub name: String,

    /// Shell command line, run with `sh -c`
    pub run: String,

    /// Tools that must be on PATH; the hook is skipped otherwise
    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default = "default_true")]
    pub mandatory: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompressionConfig {
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionConfig {
    /// `age1...` public keys or names from the top-level `keys` map
    pub recipients: Vec<String>,
}

/// A destination for finished backup sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    Local(LocalStorageConfig),
    S3(S3StorageConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalStorageConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Base directory; sets live in `<path>/<model>/<run-id>/`
    pub path: String,

    /// Number of complete sets to retain; unlimited when absent
    #[serde(default)]
    pub keep: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3StorageConfig {
    #[serde(default)]
    pub name: Option<String>,

    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Static credentials; the default AWS provider chain is used when absent
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Multipart part size in MiB
    #[serde(default)]
    pub chunk_size_mb: Option<u64>,

    #[serde(default)]
    pub keep: Option<u32>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "backup".to_string()
}

impl StorageConfig {
    /// Name used in reports, logs and the manifest
    pub fn name(&self) -> String {
        match self {
            Self::Local(c) => c.name.clone().unwrap_or_else(|| "local".to_string()),
            Self::S3(c) => c.name.clone().unwrap_or_else(|| "s3".to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
        }
    }

    pub fn keep(&self) -> Option<u32> {
        match self {
            Self::Local(c) => c.keep,
            Self::S3(c) => c.keep,
        }
    }

    pub fn is_object_store(&self) -> bool {
        matches!(self, Self::S3(_))
    }

    /// Chunk size this backend reads the spooled stream with; saturates, so
    /// an absurd `chunk-size-mb` is caught by validation instead of wrapping
    pub fn chunk_size(&self, default: u64) -> u64 {
        match self {
            Self::S3(c) => c
                .chunk_size_mb
                .map(|mb| mb.saturating_mul(MIB))
                .unwrap_or(default),
            Self::Local(_) => default,
        }
    }
}

/// Named age public keys, referenced from `encryption.recipients`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStore(BTreeMap<String, String>);

impl KeyStore {
    pub fn new(keys: BTreeMap<String, String>) -> Self {
        Self(keys)
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pipeline settings fixed for the duration of a run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDescriptor {
    pub compression_level: u32,

    /// Recipient identifiers; empty disables encryption
    pub encryption_recipients: Vec<String>,

    pub chunk_size_bytes: u64,
}

impl PipelineDescriptor {
    pub fn is_encrypted(&self) -> bool {
        !self.encryption_recipients.is_empty()
    }
}

/// A fully resolved backup model
#[derive(Debug, Clone)]
pub struct ModelPolicy {
    pub name: String,
    pub description: Option<String>,
    pub hooks: Vec<HookSpec>,
    pub sources: Vec<SourceSpec>,
    pub pipeline: PipelineDescriptor,
    pub storage: Vec<StorageConfig>,
    pub retry: RetryPolicy,
    pub key_store: KeyStore,
}
