//! Configuration management for strongbox

mod loader;
mod model;

pub use loader::*;
pub use model::*;
