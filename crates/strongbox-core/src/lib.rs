//! # strongbox-core
//!
//! Core library for strongbox providing:
//! - Configuration file parsing (strongbox.yaml) and model resolution
//! - Policy, pipeline and manifest type definitions
//! - The error taxonomy shared by every strongbox crate
//! - Retry execution engine with policy-based configuration
//! - A run-level abort signal

pub mod abort;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;
pub mod utils;

pub use abort::AbortSignal;
pub use config::{ResolveOptions, StrongboxConfig};
pub use error::{Error, Result};
pub use utils::get_home_dir;
