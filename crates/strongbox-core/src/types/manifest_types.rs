//! Backup set manifest, run identifiers and chunks.
//!
//! The manifest is the last artifact written for a backup set. A set with
//! data but no manifest is partial and is never considered by retention.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Version of the manifest format.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// Name of the manifest file/object inside a set.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Extension of the data artifact inside a set.
pub const DATA_EXTENSION: &str = "sbox";

const RUN_ID_TIME_FORMAT: &str = "%Y.%m.%d.%H.%M.%S";

/// Identifier of one run of a model, e.g. `2026.03.01.04.00.00-1a2b3c4d`.
///
/// The leading timestamp makes lexical order chronological.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Creates a run id for a run started at `at`.
    pub fn generate(at: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", at.format(RUN_ID_TIME_FORMAT), &suffix[..8]))
    }

    /// Parses a directory or key segment; returns `None` for foreign names.
    pub fn parse(s: &str) -> Option<Self> {
        let (stamp, suffix) = s.rsplit_once('-')?;
        if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(stamp, RUN_ID_TIME_FORMAT).ok()?;
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Timestamp encoded in the id.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let (stamp, _) = self.0.rsplit_once('-')?;
        NaiveDateTime::parse_from_str(stamp, RUN_ID_TIME_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A slice of the final encrypted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based, contiguous
    pub sequence_number: u64,
    pub payload: Vec<u8>,
    pub is_final: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Completion record for a stored backup set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version
    pub version: String,

    /// Model the set belongs to
    pub model_name: String,

    /// Run that produced the set
    pub run_id: RunId,

    /// Storage backend the set was written to
    pub backend: String,

    /// When the run started
    pub created_at: DateTime<Utc>,

    /// What created this set (e.g., "strongbox v0.1.0")
    pub created_by: String,

    /// Name of the data artifact inside the set
    pub object: String,

    /// Number of chunks the data was transferred in
    pub total_chunks: u64,

    /// Size of the ciphertext in bytes
    pub total_bytes: u64,

    /// Chunk size used for transfer
    pub chunk_size: u64,

    /// Digest of the full ciphertext
    pub checksum: ChecksumInfo,

    /// Compression applied before encryption
    pub compression: CompressionInfo,

    /// Encryption applied, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,

    /// Number of archive entries
    pub entries: u64,
}

/// Checksum information for integrity verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    /// Hash algorithm (sha256)
    pub algorithm: String,

    /// Hex-encoded checksum value
    pub value: String,
}

impl ChecksumInfo {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub algorithm: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub algorithm: String,

    /// Recipient public keys the set was encrypted to
    pub recipients: Vec<String>,
}

/// Number of chunks a stream of `total_bytes` splits into.
///
/// The final chunk is always shorter than `chunk_size`, so a stream that is
/// an exact multiple ends with an empty final chunk.
pub fn expected_chunks(total_bytes: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_bytes / chunk_size + 1
}

impl Manifest {
    /// Creates a manifest for an unencrypted set compressed at the default level.
    pub fn new(
        model_name: impl Into<String>,
        run_id: RunId,
        created_at: DateTime<Utc>,
        total_bytes: u64,
        chunk_size: u64,
        checksum: ChecksumInfo,
    ) -> Self {
        let model_name = model_name.into();
        Self {
            version: MANIFEST_VERSION.to_string(),
            object: data_object_name(&model_name),
            model_name,
            run_id,
            backend: String::new(),
            created_at,
            created_by: format!("strongbox v{}", env!("CARGO_PKG_VERSION")),
            total_chunks: expected_chunks(total_bytes, chunk_size),
            total_bytes,
            chunk_size,
            checksum,
            compression: CompressionInfo {
                algorithm: "gzip".to_string(),
                level: super::DEFAULT_COMPRESSION_LEVEL,
            },
            encryption: None,
            entries: 0,
        }
    }

    /// Sets the backend name.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Sets the gzip level.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression.level = level;
        self
    }

    /// Records the age recipients; an empty list means unencrypted.
    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.encryption = if recipients.is_empty() {
            None
        } else {
            Some(EncryptionInfo {
                algorithm: "age".to_string(),
                recipients,
            })
        };
        self
    }

    /// Sets the archive entry count.
    pub fn with_entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    /// Serializes the manifest to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserializes and validates a manifest.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(Error::corrupt(format!(
                "incompatible manifest version {} (expected {})",
                self.version, MANIFEST_VERSION
            )));
        }
        if self.model_name.is_empty() {
            return Err(Error::corrupt("manifest has no model name"));
        }
        if self.checksum.algorithm != "sha256" {
            return Err(Error::corrupt(format!(
                "unsupported checksum algorithm {}",
                self.checksum.algorithm
            )));
        }
        if self.checksum.value.len() != 64
            || !self.checksum.value.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::corrupt("manifest checksum is not a sha256 digest"));
        }
        if self.chunk_size == 0 {
            return Err(Error::corrupt("manifest chunk size is zero"));
        }
        let expected = expected_chunks(self.total_bytes, self.chunk_size);
        if self.total_chunks != expected {
            return Err(Error::corrupt(format!(
                "manifest lists {} chunks, {} bytes at {} per chunk needs {}",
                self.total_chunks, self.total_bytes, self.chunk_size, expected
            )));
        }
        Ok(())
    }
}

/// File/object name of a model's data artifact.
pub fn data_object_name(model_name: &str) -> String {
    format!("{}.{}", model_name, DATA_EXTENSION)
}

/// Where one chunk of a stored set lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub sequence_number: u64,
    /// File path or object key holding the chunk
    pub object: String,
    pub offset: u64,
    pub length: u64,
}

/// A complete backup set at one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBackupSet {
    pub model_name: String,
    pub run_id: RunId,
    /// Directory or key prefix of the set
    pub location: String,
    pub manifest: Manifest,
}

impl StoredBackupSet {
    /// Ordered chunk locations inside the set's data artifact.
    pub fn chunks(&self) -> Vec<ChunkLocation> {
        let object = format!("{}/{}", self.location, self.manifest.object);
        let size = self.manifest.chunk_size;
        (0..self.manifest.total_chunks)
            .map(|seq| {
                let offset = seq * size;
                ChunkLocation {
                    sequence_number: seq,
                    object: object.clone(),
                    offset,
                    length: size.min(self.manifest.total_bytes.saturating_sub(offset)),
                }
            })
            .collect()
    }
}

/// Data without a manifest: an interrupted or in-flight run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBackupSet {
    pub model_name: String,
    pub run_id: RunId,
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum() -> ChecksumInfo {
        ChecksumInfo::sha256("ab".repeat(32))
    }

    #[test]
    fn test_run_id_generate_and_parse() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 4, 5, 6).unwrap();
        let id = RunId::generate(at);
        assert!(id.as_str().starts_with("2026.03.01.04.05.06-"));
        assert_eq!(RunId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(id.timestamp(), Some(at));
    }

    #[test]
    fn test_run_id_rejects_foreign_names() {
        assert!(RunId::parse("lost+found").is_none());
        assert!(RunId::parse("2026.03.01.04.05.06-xyz").is_none());
        assert!(RunId::parse(".2026.03.01.04.05.06-1a2b3c4d.deleting").is_none());
    }

    #[test]
    fn test_run_ids_sort_chronologically() {
        let older = RunId::generate(Utc.with_ymd_and_hms(2025, 12, 31, 23, 0, 0).unwrap());
        let newer = RunId::generate(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(older < newer);
    }

    #[test]
    fn test_expected_chunks() {
        assert_eq!(expected_chunks(0, 4), 1);
        assert_eq!(expected_chunks(3, 4), 1);
        assert_eq!(expected_chunks(4, 4), 2);
        assert_eq!(expected_chunks(9, 4), 3);
    }

    #[test]
    fn test_manifest_json_and_validate() {
        let manifest = Manifest::new("documents", RunId::generate(Utc::now()), Utc::now(), 10, 4, checksum())
            .with_backend("local")
            .with_compression_level(9)
            .with_recipients(vec!["age1example".to_string()])
            .with_entries(2);

        assert_eq!(manifest.total_chunks, 3);
        assert_eq!(manifest.object, "documents.sbox");

        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_manifest_rejects_inconsistent_chunk_count() {
        let mut manifest =
            Manifest::new("documents", RunId::generate(Utc::now()), Utc::now(), 10, 4, checksum());
        manifest.total_chunks = 2;
        assert!(matches!(manifest.validate(), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_stored_set_chunk_locations() {
        let manifest =
            Manifest::new("vault", RunId::generate(Utc::now()), Utc::now(), 10, 4, checksum());
        let set = StoredBackupSet {
            model_name: "vault".to_string(),
            run_id: manifest.run_id.clone(),
            location: "/backups/vault/run".to_string(),
            manifest,
        };
        let chunks = set.chunks();
        let lengths: Vec<u64> = chunks.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        assert_eq!(chunks[2].offset, 8);
        assert_eq!(chunks[0].object, "/backups/vault/run/vault.sbox");
    }
}
