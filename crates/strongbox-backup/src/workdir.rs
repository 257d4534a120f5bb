//! Per-run scratch directory

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use strongbox_core::Result;

const SPOOL_FILENAME: &str = "stream.sbox";

/// The run's exclusive temporary directory, removed when dropped
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
}

impl WorkDir {
    /// Create under the system temp dir
    pub fn create(model: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("strongbox-{}-", model))
            .tempdir()?;
        debug!("Created work dir {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Create under `parent`
    pub fn create_in(parent: &Path, model: &str) -> Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("strongbox-{}-", model))
            .tempdir_in(parent)?;
        debug!("Created work dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the pipeline spools the sealed stream
    pub fn spool_path(&self) -> PathBuf {
        self.dir.path().join(SPOOL_FILENAME)
    }

    /// Remove the directory now, logging instead of failing
    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Could not remove work dir {}: {}", path.display(), e);
        } else {
            debug!("Removed work dir {}", path.display());
        }
    }
}
