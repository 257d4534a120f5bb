//! Units of archive content

use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::PathBuf;

/// What an archive entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    CommandOutput,
}

impl EntryKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::File => 0,
            Self::Directory => 1,
            Self::CommandOutput => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::File),
            1 => Some(Self::Directory),
            2 => Some(Self::CommandOutput),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
            Self::CommandOutput => write!(f, "command-output"),
        }
    }
}

/// Where an entry's bytes come from. Nothing is opened until the entry is
/// appended to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    File(PathBuf),
    Command {
        program: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    },
    Bytes(Vec<u8>),
    Empty,
}

/// One named unit of archive content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path recorded in the archive, always relative
    pub logical_path: String,
    pub kind: EntryKind,
    /// Size seen at enumeration; the archive records the size at open time
    pub size_hint: Option<u64>,
    pub mode: u32,
    /// Seconds since the Unix epoch
    pub mtime: i64,
    pub mandatory: bool,
    pub source: ByteSource,
}

impl ArchiveEntry {
    pub fn file(
        logical_path: impl Into<String>,
        path: impl Into<PathBuf>,
        metadata: &Metadata,
        mandatory: bool,
    ) -> Self {
        Self {
            logical_path: logical_path.into(),
            kind: EntryKind::File,
            size_hint: Some(metadata.len()),
            mode: file_mode(metadata),
            mtime: modified_secs(metadata),
            mandatory,
            source: ByteSource::File(path.into()),
        }
    }

    pub fn directory(logical_path: impl Into<String>, metadata: &Metadata) -> Self {
        Self {
            logical_path: logical_path.into(),
            kind: EntryKind::Directory,
            size_hint: Some(0),
            mode: file_mode(metadata),
            mtime: modified_secs(metadata),
            mandatory: false,
            source: ByteSource::Empty,
        }
    }

    /// Captured standard output of `program`
    pub fn command(
        logical_path: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        mandatory: bool,
    ) -> Self {
        Self {
            logical_path: logical_path.into(),
            kind: EntryKind::CommandOutput,
            size_hint: None,
            mode: 0o644,
            mtime: Utc::now().timestamp(),
            mandatory,
            source: ByteSource::Command {
                program: program.into(),
                args,
                cwd,
            },
        }
    }

    /// In-memory content
    pub fn bytes(logical_path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            logical_path: logical_path.into(),
            kind: EntryKind::File,
            size_hint: Some(data.len() as u64),
            mode: 0o644,
            mtime: Utc::now().timestamp(),
            mandatory: false,
            source: ByteSource::Bytes(data),
        }
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn modified_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or(0)
}
