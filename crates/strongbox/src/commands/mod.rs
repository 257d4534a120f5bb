//! Command implementations

pub mod check;
pub mod extract;
pub mod keygen;
pub mod list;
pub mod prune;
pub mod run;

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::Args;
use strongbox_core::types::ModelPolicy;
use strongbox_core::{ResolveOptions, StrongboxConfig};
use tracing::debug;

/// Model selection shared by the commands that act on stored sets
#[derive(Args, Debug, Clone, Default)]
pub struct ModelSelection {
    /// Models to act on (all when omitted)
    pub models: Vec<String>,

    /// Skip object-store destinations
    #[arg(long)]
    pub local_only: bool,
}

impl ModelSelection {
    fn options(&self) -> ResolveOptions {
        ResolveOptions {
            models: self.models.clone(),
            local_only: self.local_only,
        }
    }
}

/// Load the config file and resolve the selected models
pub fn load_models(
    config: Option<&Utf8Path>,
    selection: &ModelSelection,
) -> Result<(StrongboxConfig, Vec<ModelPolicy>)> {
    let loaded = StrongboxConfig::load(config).context("Failed to load configuration")?;
    let models = loaded
        .models(&selection.options())
        .with_context(|| format!("Invalid configuration in {}", loaded.config_path))?;
    debug!("Resolved {} model(s) from {}", models.len(), loaded.config_path);
    Ok((loaded, models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    const CONFIG: &str = r#"
models:
  - name: documents
    sources: [{type: path, path: /srv/documents}]
    storage: [{type: local, path: /srv/backups, keep: 2}]
  - name: photos
    sources: [{type: glob, pattern: "*.jpg", root: /srv/photos}]
    storage:
      - {type: local, path: /srv/backups}
      - {type: s3, bucket: photos, region: eu-west-1}
"#;

    fn write_config(dir: &tempfile::TempDir) -> Utf8PathBuf {
        let path = Utf8PathBuf::try_from(dir.path().join("strongbox.yaml")).unwrap();
        std::fs::write(&path, CONFIG).unwrap();
        path
    }

    #[test]
    fn test_load_models_applies_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir);
        let selection = ModelSelection {
            models: vec!["photos".to_string()],
            local_only: true,
        };

        let (_, models) = load_models(Some(&path), &selection).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "photos");
        assert_eq!(models[0].storage.len(), 1);
        assert!(!models[0].storage[0].is_object_store());
    }

    #[test]
    fn test_config_errors_survive_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir);
        let selection = ModelSelection {
            models: vec!["videos".to_string()],
            local_only: false,
        };

        let err = load_models(Some(&path), &selection).unwrap_err();
        let core = err.downcast_ref::<strongbox_core::Error>().unwrap();
        assert!(core.is_config_error());

        let missing = Utf8PathBuf::try_from(dir.path().join("absent.yaml")).unwrap();
        let err = load_models(Some(&missing), &ModelSelection::default()).unwrap_err();
        assert!(err
            .downcast_ref::<strongbox_core::Error>()
            .is_some_and(|e| e.is_config_error()));
    }
}
