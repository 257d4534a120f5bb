//! # strongbox-backup
//!
//! The backup engine: everything between a resolved model policy and the
//! storage backends.
//!
//! # Features
//!
//! - **Sources**: paths (with excludes), globs and captured command output
//! - **Archive**: a single ordered container stream with per-entry metadata
//! - **Streaming pipeline**: archive, gzip and age encryption on dedicated
//!   threads joined by bounded pipes, spooled once with a sha256 digest
//! - **Chunking**: fixed-size, contiguous chunks read independently per backend
//! - **Orchestration**: hooks, enumeration, pipeline, concurrent upload and
//!   retention, driven by an explicit run state machine
//! - **Restore**: verify, decrypt, decompress and unpack a stored set
//!
//! # Example
//!
//! ```no_run
//! use strongbox_backup::Orchestrator;
//! use strongbox_core::{AbortSignal, ResolveOptions, StrongboxConfig};
//!
//! #[tokio::main]
//! async fn main() -> strongbox_core::Result<()> {
//!     let config = StrongboxConfig::load(None)?;
//!     let models = config.models(&ResolveOptions::default())?;
//!
//!     let orchestrator = Orchestrator::new();
//!     for report in orchestrator.run_all(&models, false, &AbortSignal::new()).await {
//!         println!("{}: {}", report.model, report.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod chunker;
pub mod compression;
pub mod encryption;
pub mod entry;
pub mod hooks;
pub mod orchestrator;
pub mod pipe;
pub mod pipeline;
pub mod restore;
pub mod sources;
pub mod spool;
pub mod state;
pub mod workdir;

pub use archive::{ArchiveBuilder, ArchiveReader, BuildSummary, EntryHeader};
pub use chunker::Chunker;
pub use entry::{ArchiveEntry, ByteSource, EntryKind};
pub use hooks::HookOutcome;
pub use orchestrator::{
    BackendProvider, BackendReport, BackendStatus, ConfiguredBackends, Orchestrator, RunReport,
};
pub use pipeline::{run_pipeline, PipelineOutput};
pub use restore::{extract_set, verify_set, ExtractReport};
pub use sources::{EnumerationContext, FsEnumerator, SourceEnumerator};
pub use state::{RunState, RunStateMachine};
pub use workdir::WorkDir;
