//! Configuration file loading and parsing

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml_ng::Value;
use std::fs;

use crate::error::{Error, Result};
use crate::types::ModelPolicy;
use crate::utils::get_home_dir;

use super::model::{ConfigFile, ResolveOptions};

/// Configuration file names to search for
const CONFIG_FILE_NAMES: &[&str] = &["strongbox.yaml", "strongbox.yml"];

/// Mapping keys whose values are passed to a shell verbatim
const VERBATIM_KEYS: &[&str] = &["run"];

/// Loaded and validated strongbox configuration
#[derive(Debug, Clone)]
pub struct StrongboxConfig {
    /// The parsed configuration
    pub config: ConfigFile,

    /// Path to the configuration file
    pub config_path: Utf8PathBuf,
}

impl StrongboxConfig {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_owned(),
            None => Self::find_config()?,
        };

        let content = fs::read_to_string(&config_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config_not_found(config_path.as_str())
            } else {
                Error::Io(e)
            }
        })?;

        let config = Self::parse(&content)?;
        tracing::debug!(
            "Loaded {} model(s) from {}",
            config.models.len(),
            config_path
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Parse and validate YAML content
    ///
    /// `${VAR}` references and a leading `~` are expanded in every string
    /// value except hook `run` commands, which the shell expands itself.
    pub fn parse(content: &str) -> Result<ConfigFile> {
        let mut value: Value = serde_yaml_ng::from_str(content)?;
        expand_value(&mut value, None)?;
        let config: ConfigFile = serde_yaml_ng::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the models selected by `options`
    pub fn models(&self, options: &ResolveOptions) -> Result<Vec<ModelPolicy>> {
        self.config.resolve(options)
    }

    /// Find the configuration file in the current directory or the user config dir
    fn find_config() -> Result<Utf8PathBuf> {
        let cwd = std::env::current_dir().map_err(Error::Io)?;
        let cwd = Utf8PathBuf::try_from(cwd)
            .map_err(|_| Error::invalid_config("Current directory path is not valid UTF-8"))?;

        let mut candidates: Vec<Utf8PathBuf> =
            CONFIG_FILE_NAMES.iter().map(|name| cwd.join(name)).collect();

        if let Some(config_dir) = dirs::config_dir().and_then(|d| Utf8PathBuf::try_from(d).ok()) {
            candidates.extend(
                CONFIG_FILE_NAMES
                    .iter()
                    .map(|name| config_dir.join("strongbox").join(name)),
            );
        }

        candidates
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| Error::config_not_found(cwd.join(CONFIG_FILE_NAMES[0]).as_str()))
    }
}

fn expand_value(value: &mut Value, key: Option<&str>) -> Result<()> {
    match value {
        Value::String(s) => {
            if !key.is_some_and(|k| VERBATIM_KEYS.contains(&k)) {
                *s = expand_str(s)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                expand_value(item, None)?;
            }
        }
        Value::Mapping(map) => {
            for (k, v) in map.iter_mut() {
                expand_value(v, k.as_str())?;
            }
        }
        Value::Tagged(tagged) => expand_value(&mut tagged.value, key)?,
        _ => {}
    }
    Ok(())
}

/// Expand `~` and `$VAR`/`${VAR}`; an unset variable is an error
pub fn expand_str(input: &str) -> Result<String> {
    shellexpand::full_with_context(
        input,
        || {
            get_home_dir()
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        },
        |var: &str| std::env::var(var).map(Some),
    )
    .map(|expanded| expanded.into_owned())
    .map_err(|e| Error::missing_env(e.var_name))
}
