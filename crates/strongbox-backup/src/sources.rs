//! Source enumeration
//!
//! Turns the configured source specs into an ordered list of
//! [`ArchiveEntry`] values. Nothing is read here beyond metadata; bytes are
//! pulled when the archive builder appends each entry.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use strongbox_core::types::{CommandSource, GlobSource, PathSource, SourceSpec};
use strongbox_core::{Error, Result};

use crate::entry::ArchiveEntry;

/// Placeholder in source paths replaced with the run's work dir
pub const WORKDIR_PLACEHOLDER: &str = "{workdir}";

/// Run-specific values available to enumeration
#[derive(Debug, Clone)]
pub struct EnumerationContext {
    pub workdir: PathBuf,
}

impl EnumerationContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn substitute(&self, value: &str) -> String {
        value.replace(WORKDIR_PLACEHOLDER, &self.workdir.to_string_lossy())
    }
}

/// A source that contributed nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSource {
    pub source: String,
    pub reason: String,
}

/// Entries found for one or more sources
#[derive(Debug, Default)]
pub struct Enumeration {
    pub entries: Vec<ArchiveEntry>,
    pub skipped: Vec<SkippedSource>,
}

impl Enumeration {
    fn skip(&mut self, spec: &SourceSpec, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Skipping {}: {}", spec.describe(), reason);
        self.skipped.push(SkippedSource {
            source: spec.describe(),
            reason,
        });
    }

    fn extend(&mut self, other: Enumeration) {
        self.entries.extend(other.entries);
        self.skipped.extend(other.skipped);
    }
}

/// Produces archive entries for a source spec
pub trait SourceEnumerator: Send + Sync {
    fn enumerate(&self, spec: &SourceSpec, ctx: &EnumerationContext) -> Result<Enumeration>;
}

/// Enumerate every spec in order; duplicate logical paths keep the first
pub fn enumerate_all(
    enumerator: &dyn SourceEnumerator,
    specs: &[SourceSpec],
    ctx: &EnumerationContext,
) -> Result<Enumeration> {
    let mut all = Enumeration::default();
    for spec in specs {
        all.extend(enumerator.enumerate(spec, ctx)?);
    }

    let mut seen = HashSet::new();
    all.entries.retain(|entry| {
        let first = seen.insert(entry.logical_path.clone());
        if !first {
            debug!("Dropping duplicate archive path {}", entry.logical_path);
        }
        first
    });
    Ok(all)
}

/// Enumerates the local filesystem and PATH
#[derive(Debug, Clone, Copy, Default)]
pub struct FsEnumerator;

impl SourceEnumerator for FsEnumerator {
    fn enumerate(&self, spec: &SourceSpec, ctx: &EnumerationContext) -> Result<Enumeration> {
        match spec {
            SourceSpec::Path(source) => enumerate_path(spec, source, ctx),
            SourceSpec::Glob(source) => enumerate_glob(spec, source, ctx),
            SourceSpec::Command(source) => enumerate_command(spec, source, ctx),
        }
    }
}

/// Archive path for `path`: relative to `root` if given, else the absolute
/// path without its leading separator; prefixed with the archive group.
fn logical_path(path: &Path, root: Option<&Path>, archive: Option<&str>) -> Result<String> {
    let relative = match root {
        Some(root) => path.strip_prefix(root).map_err(|_| {
            Error::invalid_config(format!(
                "{} is not under root {}",
                path.display(),
                root.display()
            ))
        })?,
        None => path,
    };

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let mut logical = archive
        .map(|a| a.trim_matches('/').to_string())
        .filter(|a| !a.is_empty())
        .into_iter()
        .chain(parts)
        .collect::<Vec<_>>()
        .join("/");
    if logical.is_empty() {
        logical.push('.');
    }
    Ok(logical)
}

fn exclusion_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::invalid_config(format!("invalid exclude pattern '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid_config(format!("invalid exclude patterns: {}", e)))
}

fn enumerate_path(
    spec: &SourceSpec,
    source: &PathSource,
    ctx: &EnumerationContext,
) -> Result<Enumeration> {
    let mut found = Enumeration::default();
    let root = source.root.as_deref().map(|r| PathBuf::from(ctx.substitute(r)));
    let path = match PathBuf::from(ctx.substitute(&source.path)) {
        relative if relative.is_relative() => match &root {
            Some(root) => root.join(relative),
            None => relative,
        },
        absolute => absolute,
    };
    let archive = source.archive.as_deref();

    let metadata = match std::fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if source.mandatory => {
            debug!("Mandatory source {} unavailable: {}", path.display(), e);
            return Err(Error::mandatory_source_missing(path.display().to_string()));
        }
        Err(e) => {
            found.skip(spec, e.to_string());
            return Ok(found);
        }
    };

    if !metadata.is_dir() {
        let logical = logical_path(&path, root.as_deref(), archive)?;
        found
            .entries
            .push(ArchiveEntry::file(logical, &path, &metadata, source.mandatory));
        return Ok(found);
    }

    let excludes = exclusion_set(&source.exclude)?;
    let walker = WalkDir::new(&path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let relative = e.path().strip_prefix(&path).unwrap_or(e.path());
            relative.as_os_str().is_empty() || !excludes.is_match(relative)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                found.skip(spec, e.to_string());
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                found.skip(spec, e.to_string());
                continue;
            }
        };
        let logical = logical_path(entry.path(), root.as_deref(), archive)?;

        if entry.file_type().is_dir() {
            found.entries.push(ArchiveEntry::directory(logical, &metadata));
        } else if entry.file_type().is_file() {
            found
                .entries
                .push(ArchiveEntry::file(logical, entry.path(), &metadata, false));
        } else {
            debug!("Not archiving special file {}", entry.path().display());
        }
    }

    Ok(found)
}

fn enumerate_glob(
    spec: &SourceSpec,
    source: &GlobSource,
    ctx: &EnumerationContext,
) -> Result<Enumeration> {
    let mut found = Enumeration::default();
    let root = match &source.root {
        Some(root) => PathBuf::from(ctx.substitute(root)),
        None => std::env::current_dir()?,
    };
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()).trim_end_matches('/'),
        ctx.substitute(&source.pattern)
    );

    let matches = glob::glob(&pattern).map_err(|e| {
        Error::invalid_config(format!("invalid glob '{}': {}", source.pattern, e))
    })?;

    for path in matches {
        let path = match path {
            Ok(path) => path,
            Err(e) => {
                found.skip(spec, e.to_string());
                continue;
            }
        };
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                found.skip(spec, format!("{}: {}", path.display(), e));
                continue;
            }
        };
        let logical = logical_path(&path, Some(&root), source.archive.as_deref())?;
        found
            .entries
            .push(ArchiveEntry::file(logical, &path, &metadata, false));
    }

    if found.entries.is_empty() {
        if source.mandatory {
            return Err(Error::mandatory_source_missing(spec.describe()));
        }
        found.skip(spec, "no files matched");
    }
    Ok(found)
}

fn enumerate_command(
    spec: &SourceSpec,
    source: &CommandSource,
    ctx: &EnumerationContext,
) -> Result<Enumeration> {
    let mut found = Enumeration::default();
    let tool = source.requires.as_deref().unwrap_or(&source.program);

    if which::which(tool).is_err() {
        // A missing tool skips the source regardless of `mandatory`.
        found.skip(spec, format!("{} not found on PATH", tool));
        return Ok(found);
    }

    let args = source.args.iter().map(|a| ctx.substitute(a)).collect();
    let logical = logical_path(Path::new(&source.name), None, source.archive.as_deref())?;
    found.entries.push(ArchiveEntry::command(
        logical,
        ctx.substitute(&source.program),
        args,
        Some(ctx.workdir.clone()),
        source.mandatory,
    ));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use std::fs;

    fn path_spec(
        path: &Path,
        root: Option<&Path>,
        exclude: &[&str],
        mandatory: bool,
    ) -> SourceSpec {
        SourceSpec::Path(PathSource {
            path: path.display().to_string(),
            root: root.map(|r| r.display().to_string()),
            archive: None,
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            mandatory,
        })
    }

    fn paths(found: &Enumeration) -> Vec<&str> {
        found.entries.iter().map(|e| e.logical_path.as_str()).collect()
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("docs");
        fs::create_dir_all(docs.join("cache")).unwrap();
        fs::write(docs.join("a.txt"), b"a").unwrap();
        fs::write(docs.join("b.txt"), b"bb").unwrap();
        fs::write(docs.join("cache/blob"), b"x").unwrap();
        dir
    }

    #[test]
    fn test_directory_tree_relative_to_root() {
        let dir = tree();
        let ctx = EnumerationContext::new(dir.path());
        let spec = path_spec(&dir.path().join("docs"), Some(dir.path()), &[], false);

        let found = FsEnumerator.enumerate(&spec, &ctx).unwrap();
        assert_eq!(
            paths(&found),
            ["docs", "docs/a.txt", "docs/b.txt", "docs/cache", "docs/cache/blob"]
        );
        assert_eq!(found.entries[0].kind, EntryKind::Directory);
        assert_eq!(found.entries[2].size_hint, Some(2));
    }

    #[test]
    fn test_excludes_prune_subtrees() {
        let dir = tree();
        let ctx = EnumerationContext::new(dir.path());
        let spec = path_spec(&dir.path().join("docs"), Some(dir.path()), &["cache"], false);

        let found = FsEnumerator.enumerate(&spec, &ctx).unwrap();
        assert_eq!(paths(&found), ["docs", "docs/a.txt", "docs/b.txt"]);
    }

    #[test]
    fn test_without_root_uses_absolute_path() {
        let dir = tree();
        let file = dir.path().join("docs/a.txt");
        let found = FsEnumerator
            .enumerate(&path_spec(&file, None, &[], true), &EnumerationContext::new(dir.path()))
            .unwrap();
        let expected = file.to_string_lossy().trim_start_matches('/').to_string();
        assert_eq!(found.entries[0].logical_path, expected);
        assert!(found.entries[0].mandatory);
    }

    #[test]
    fn test_missing_optional_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let spec = path_spec(&dir.path().join("absent"), None, &[], false);
        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap();
        assert!(found.entries.is_empty());
        assert_eq!(found.skipped.len(), 1);
    }

    #[test]
    fn test_missing_mandatory_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = path_spec(&dir.path().join("absent"), None, &[], true);
        let err = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, Error::MandatorySourceMissing { .. }));
    }

    #[test]
    fn test_relative_path_resolves_under_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("Documents")).unwrap();
        fs::write(dir.path().join("Documents/tax.pdf"), b"%PDF").unwrap();
        let spec = SourceSpec::Path(PathSource {
            path: "Documents".into(),
            root: Some(dir.path().display().to_string()),
            archive: Some("data".into()),
            exclude: vec![],
            mandatory: true,
        });

        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new("/nonexistent-workdir"))
            .unwrap();
        assert!(found.skipped.is_empty());
        assert_eq!(paths(&found), ["data/Documents", "data/Documents/tax.pdf"]);
    }

    #[test]
    fn test_workdir_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("listing.txt"), b"pkgs").unwrap();
        let spec = SourceSpec::Path(PathSource {
            path: "{workdir}/listing.txt".into(),
            root: Some("{workdir}".into()),
            archive: Some("installation".into()),
            exclude: vec![],
            mandatory: true,
        });
        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap();
        assert_eq!(paths(&found), ["installation/listing.txt"]);
    }

    #[test]
    fn test_glob_matches_files_only() {
        let dir = tree();
        fs::write(dir.path().join(".bash_history"), b"ls").unwrap();
        fs::write(dir.path().join(".zsh_history"), b"cd").unwrap();
        fs::create_dir(dir.path().join(".fake_history")).unwrap();

        let spec = SourceSpec::Glob(GlobSource {
            pattern: ".*history".into(),
            root: Some(dir.path().display().to_string()),
            archive: Some("home".into()),
            mandatory: false,
        });
        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap();
        assert_eq!(paths(&found), ["home/.bash_history", "home/.zsh_history"]);
    }

    #[test]
    fn test_mandatory_glob_without_matches_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SourceSpec::Glob(GlobSource {
            pattern: "*.kdbx".into(),
            root: Some(dir.path().display().to_string()),
            archive: None,
            mandatory: true,
        });
        assert!(matches!(
            FsEnumerator.enumerate(&spec, &EnumerationContext::new(dir.path())),
            Err(Error::MandatorySourceMissing { .. })
        ));
    }

    #[test]
    fn test_command_with_missing_tool_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SourceSpec::Command(CommandSource {
            name: "pkgs.txt".into(),
            program: "strongbox-no-such-tool".into(),
            args: vec![],
            requires: None,
            archive: None,
            mandatory: true,
        });
        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap();
        assert!(found.entries.is_empty());
        assert_eq!(found.skipped.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_entry_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SourceSpec::Command(CommandSource {
            name: "env.txt".into(),
            program: "sh".into(),
            args: vec!["-c".into(), "pwd".into()],
            requires: None,
            archive: Some("installation".into()),
            mandatory: false,
        });
        let found = FsEnumerator
            .enumerate(&spec, &EnumerationContext::new(dir.path()))
            .unwrap();
        assert_eq!(paths(&found), ["installation/env.txt"]);
        assert_eq!(
            found.entries[0].source,
            crate::entry::ByteSource::Command {
                program: "sh".into(),
                args: vec!["-c".into(), "pwd".into()],
                cwd: Some(dir.path().to_path_buf()),
            }
        );
    }

    #[test]
    fn test_enumerate_all_drops_duplicates() {
        let dir = tree();
        let ctx = EnumerationContext::new(dir.path());
        let file = dir.path().join("docs/a.txt");
        let specs = vec![
            path_spec(&file, Some(dir.path()), &[], false),
            path_spec(&dir.path().join("docs"), Some(dir.path()), &["cache"], false),
        ];
        let found = enumerate_all(&FsEnumerator, &specs, &ctx).unwrap();
        assert_eq!(paths(&found), ["docs/a.txt", "docs", "docs/b.txt"]);
    }
}
