//! Serde shape of strongbox.yaml and model resolution

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::types::{
    CompressionConfig, EncryptionConfig, HookSpec, KeyStore, ModelPolicy, PipelineDescriptor,
    RetryPolicy, SourceSpec, StorageConfig, DEFAULT_CHUNK_SIZE_MB, MAX_CHUNK_SIZE,
    MAX_OBJECT_STORE_PART_SIZE, MIB, MIN_OBJECT_STORE_PART_SIZE,
};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    /// Named age public keys
    #[serde(default)]
    pub keys: KeyStore,

    /// Settings applied to every model
    #[serde(default)]
    pub defaults: ModelDefaults,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Settings every model inherits unless it overrides them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelDefaults {
    #[serde(default)]
    pub compression: Option<CompressionConfig>,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub chunk_size_mb: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Destinations prepended to each model's own storage list
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
}

/// One backup model as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelConfig {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub hooks: Vec<HookSpec>,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub compression: Option<CompressionConfig>,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub chunk_size_mb: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub storage: Vec<StorageConfig>,

    /// Whether `defaults.storage` applies to this model
    #[serde(default = "default_true")]
    pub inherit_storage: bool,
}

fn default_true() -> bool {
    true
}

/// Selection applied when turning the file into runnable policies
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Only these models; all when empty
    pub models: Vec<String>,

    /// Drop object-store destinations
    pub local_only: bool,
}

impl ConfigFile {
    /// Checks everything that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::invalid_config("no models defined"));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if !is_safe_name(&model.name) {
                return Err(Error::invalid_config(format!(
                    "model name '{}' may only contain letters, digits, '-', '_' and '.'",
                    model.name
                )));
            }
            if !names.insert(model.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate model name '{}'",
                    model.name
                )));
            }
            self.resolve_model(model, false)
                .and_then(|policy| validate_policy(&policy))?;
        }

        Ok(())
    }

    /// Merge defaults into the selected models
    pub fn resolve(&self, options: &ResolveOptions) -> Result<Vec<ModelPolicy>> {
        for wanted in &options.models {
            if !self.models.iter().any(|m| &m.name == wanted) {
                return Err(Error::invalid_config(format!("unknown model '{}'", wanted)));
            }
        }

        self.models
            .iter()
            .filter(|m| options.models.is_empty() || options.models.contains(&m.name))
            .map(|m| {
                let policy = self.resolve_model(m, options.local_only)?;
                validate_policy(&policy)?;
                Ok(policy)
            })
            .collect()
    }

    fn resolve_model(&self, model: &ModelConfig, local_only: bool) -> Result<ModelPolicy> {
        let defaults = &self.defaults;

        let compression = model
            .compression
            .clone()
            .or_else(|| defaults.compression.clone())
            .unwrap_or_default();
        let recipients = model
            .encryption
            .as_ref()
            .or(defaults.encryption.as_ref())
            .map(|e| e.recipients.clone())
            .unwrap_or_default();
        let chunk_size_mb = model
            .chunk_size_mb
            .or(defaults.chunk_size_mb)
            .unwrap_or(DEFAULT_CHUNK_SIZE_MB);
        let chunk_size_bytes = chunk_size_mb.checked_mul(MIB).ok_or_else(|| {
            Error::invalid_config(format!(
                "model '{}': chunk-size-mb {} is too large",
                model.name, chunk_size_mb
            ))
        })?;

        let mut storage = Vec::new();
        if model.inherit_storage {
            storage.extend(defaults.storage.iter().cloned());
        }
        storage.extend(model.storage.iter().cloned());
        if local_only {
            storage.retain(|s| !s.is_object_store());
        }

        Ok(ModelPolicy {
            name: model.name.clone(),
            description: model.description.clone(),
            hooks: model.hooks.clone(),
            sources: model.sources.clone(),
            pipeline: PipelineDescriptor {
                compression_level: compression.level,
                encryption_recipients: recipients,
                chunk_size_bytes,
            },
            storage,
            retry: model
                .retry
                .clone()
                .or_else(|| defaults.retry.clone())
                .unwrap_or_default(),
            key_store: self.keys.clone(),
        })
    }
}

fn validate_policy(policy: &ModelPolicy) -> Result<()> {
    let model = &policy.name;

    if !(1..=9).contains(&policy.pipeline.compression_level) {
        return Err(Error::invalid_config(format!(
            "model '{}': compression level {} is outside 1-9",
            model, policy.pipeline.compression_level
        )));
    }
    if policy.pipeline.chunk_size_bytes == 0 {
        return Err(Error::invalid_config(format!(
            "model '{}': chunk size must be greater than zero",
            model
        )));
    }
    if policy.pipeline.chunk_size_bytes > MAX_CHUNK_SIZE {
        return Err(Error::invalid_config(format!(
            "model '{}': chunk size must be at most {} MiB",
            model,
            MAX_CHUNK_SIZE / MIB
        )));
    }
    if policy.sources.is_empty() {
        return Err(Error::missing_field(format!("models.{}.sources", model)));
    }
    if policy.storage.is_empty() {
        return Err(Error::invalid_config(format!(
            "model '{}' has no storage destinations",
            model
        )));
    }
    if policy.retry.max_attempts == 0 {
        return Err(Error::invalid_config(format!(
            "model '{}': retry max-attempts must be at least 1",
            model
        )));
    }

    let mut names = HashSet::new();
    for storage in &policy.storage {
        let name = storage.name();
        if !is_safe_name(&name) {
            return Err(Error::invalid_config(format!(
                "model '{}': invalid storage name '{}'",
                model, name
            )));
        }
        if !names.insert(name.clone()) {
            return Err(Error::invalid_config(format!(
                "model '{}': duplicate storage name '{}'",
                model, name
            )));
        }
        if storage.keep() == Some(0) {
            return Err(Error::invalid_config(format!(
                "model '{}': storage '{}' must keep at least one backup",
                model, name
            )));
        }
        if let StorageConfig::S3(s3) = storage {
            if s3.bucket.is_empty() {
                return Err(Error::missing_field(format!(
                    "models.{}.storage.{}.bucket",
                    model, name
                )));
            }
            if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                return Err(Error::invalid_config(format!(
                    "model '{}': storage '{}' needs both access-key-id and secret-access-key",
                    model, name
                )));
            }
            let part_size = storage.chunk_size(policy.pipeline.chunk_size_bytes);
            if part_size < MIN_OBJECT_STORE_PART_SIZE {
                return Err(Error::invalid_config(format!(
                    "model '{}': storage '{}' chunk size must be at least 5 MiB",
                    model, name
                )));
            }
            if part_size > MAX_OBJECT_STORE_PART_SIZE {
                return Err(Error::invalid_config(format!(
                    "model '{}': storage '{}' chunk size must be at most 5 GiB",
                    model, name
                )));
            }
        }
    }

    for hook in &policy.hooks {
        if hook.name.is_empty() || hook.run.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "model '{}': hooks need a name and a command",
                model
            )));
        }
    }

    Ok(())
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
