//! Error types for strongbox-core

use thiserror::Error;

/// Result type alias using strongbox-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every strongbox crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Missing required field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Environment variable referenced by the configuration is not set
    #[error("Environment variable not set: {var}")]
    MissingEnv { var: String },

    /// An optional source could not be read; the entry is skipped
    #[error("Source unavailable: {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// A source marked mandatory does not exist
    #[error("Mandatory source missing: {path}")]
    MandatorySourceMissing { path: String },

    /// A mandatory pre-run hook failed
    #[error("Hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    /// Archive, compression or encryption failure
    #[error("Pipeline error: {message}")]
    Pipeline { message: String },

    /// Transfer to a storage backend failed
    #[error("Transfer to '{backend}' failed: {message}")]
    Transfer {
        backend: String,
        message: String,
        transient: bool,
    },

    /// Retention pruning failed
    #[error("Prune on '{backend}' failed: {message}")]
    Prune { backend: String, message: String },

    /// Chunk sequence is not contiguous
    #[error("Chunk sequence gap: expected {expected}, found {found}")]
    ChunkGap { expected: u64, found: u64 },

    /// Stored data does not match its manifest or container format
    #[error("Corrupt backup data: {message}")]
    Corrupt { message: String },

    /// The run state machine was driven out of order
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The run was aborted
    #[error("Run cancelled")]
    Cancelled,

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create a missing environment variable error
    pub fn missing_env(var: impl Into<String>) -> Self {
        Self::MissingEnv { var: var.into() }
    }

    /// Create a source unavailable error
    pub fn source_unavailable(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a mandatory source missing error
    pub fn mandatory_source_missing(path: impl Into<String>) -> Self {
        Self::MandatorySourceMissing { path: path.into() }
    }

    /// Create a hook failure error
    pub fn hook_failed(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HookFailed {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a pipeline error
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Create a transfer error that may succeed when retried
    pub fn transient(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            backend: backend.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a transfer error that will not succeed when retried
    pub fn permanent(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            backend: backend.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Create a prune error
    pub fn prune(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Prune {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a corruption error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transfer {
                transient: true,
                ..
            }
        )
    }

    /// Whether the error was raised while loading or validating configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingField { .. }
                | Self::MissingEnv { .. }
                | Self::YamlParse(_)
        )
    }
}
