//! Extraction of stored sets
//!
//! Works on a set directory as written by the local backend: the manifest is
//! read and the data artifact is verified against it before anything is
//! decrypted or unpacked.

use age::x25519::Identity;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use strongbox_core::types::{Manifest, MANIFEST_FILENAME};
use strongbox_core::{Error, Result};

use crate::archive::ArchiveReader;
use crate::compression::decompressor;
use crate::encryption::decryptor;
use crate::entry::EntryKind;

/// What an extraction wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub entries: u64,
    pub directories: u64,
    pub bytes: u64,
}

/// Load the manifest of a set and check the data artifact matches it
pub fn verify_set(set_dir: &Path) -> Result<(Manifest, PathBuf)> {
    let manifest_path = set_dir.join(MANIFEST_FILENAME);
    let json = std::fs::read_to_string(&manifest_path).map_err(|e| {
        Error::corrupt(format!(
            "{} is not a complete set: {}",
            set_dir.display(),
            e
        ))
    })?;
    let manifest = Manifest::from_json(&json)?;

    let data_path = set_dir.join(&manifest.object);
    let mut file = File::open(&data_path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    let checksum = format!("{:x}", hasher.finalize());

    if size != manifest.total_bytes {
        return Err(Error::corrupt(format!(
            "{} is {} bytes, manifest lists {}",
            data_path.display(),
            size,
            manifest.total_bytes
        )));
    }
    if checksum != manifest.checksum.value {
        return Err(Error::corrupt(format!(
            "checksum mismatch for {}",
            data_path.display()
        )));
    }
    debug!("Verified {} ({} bytes)", data_path.display(), size);
    Ok((manifest, data_path))
}

/// Verify, decrypt, decompress and unpack a set into `output`
pub fn extract_set(
    set_dir: &Path,
    identities: &[Identity],
    output: &Path,
) -> Result<ExtractReport> {
    let (manifest, data_path) = verify_set(set_dir)?;
    let reader = BufReader::new(File::open(&data_path)?);

    let plain: Box<dyn Read> = if manifest.encryption.is_some() {
        if identities.is_empty() {
            return Err(Error::invalid_config(
                "set is encrypted; an identity file is required",
            ));
        }
        Box::new(decryptor(reader, identities)?)
    } else {
        Box::new(reader)
    };

    let report = unpack(decompressor(plain), output)?;
    if report.entries != manifest.entries {
        return Err(Error::corrupt(format!(
            "archive holds {} entries, manifest lists {}",
            report.entries, manifest.entries
        )));
    }
    info!(
        "Extracted {} entries of {}/{} into {}",
        report.entries,
        manifest.model_name,
        manifest.run_id,
        output.display()
    );
    Ok(report)
}

/// Only plain relative paths may be written
fn safe_join(output: &Path, logical: &str) -> Result<PathBuf> {
    let relative = Path::new(logical);
    if logical.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::corrupt(format!("unsafe archive path '{}'", logical)));
    }
    Ok(output.join(relative))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Write every entry of an archive stream below `output`
pub fn unpack(reader: impl Read, output: &Path) -> Result<ExtractReport> {
    let mut archive = ArchiveReader::new(reader)?;
    let mut report = ExtractReport::default();
    let mut directory_modes = Vec::new();

    std::fs::create_dir_all(output)?;
    while let Some(header) = archive.next_header()? {
        let target = safe_join(output, &header.path)?;
        match header.kind {
            EntryKind::Directory => {
                std::fs::create_dir_all(&target)?;
                directory_modes.push((target, header.mode));
                report.directories += 1;
            }
            EntryKind::File | EntryKind::CommandOutput => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                report.bytes += archive.copy_body(&mut file)?;
                drop(file);
                apply_mode(&target, header.mode)?;
            }
        }
        report.entries += 1;
    }

    // Directory modes last, so read-only directories do not block their children.
    for (dir, mode) in directory_modes.into_iter().rev() {
        apply_mode(&dir, mode)?;
    }
    Ok(report)
}
