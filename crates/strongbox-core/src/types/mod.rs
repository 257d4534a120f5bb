//! Type definitions for strongbox policies, manifests and runtime settings

mod manifest_types;
mod policy_types;
mod runtime_config;

pub use manifest_types::*;
pub use policy_types::*;
pub use runtime_config::*;
