//! Archive → gzip → age → spool pipeline
//!
//! Three threads joined by bounded pipes:
//!
//! ```text
//! archive builder ──pipe──▶ gzip ▶ age ──pipe──▶ spool (sha256 + size)
//! ```
//!
//! The whole function blocks; async callers run it on the blocking pool.
//! A failure in any stage fails the run and leaves no usable spool.

use std::io::{self, Write};
use std::path::Path;
use std::thread::ScopedJoinHandle;
use tracing::{debug, info};

use strongbox_core::types::{KeyStore, PipelineDescriptor};
use strongbox_core::{AbortSignal, Error, Result};

use crate::archive::{ArchiveBuilder, BuildSummary};
use crate::compression::compressor;
use crate::encryption::{resolve_recipients, Encryptor};
use crate::entry::ArchiveEntry;
use crate::pipe;
use crate::spool::{SpoolFile, SpoolWriter};

/// Blocks queued between two stages
const PIPE_DEPTH: usize = 16;

/// Result of a successful pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub spool: SpoolFile,
    pub summary: BuildSummary,
    /// Public keys the stream was encrypted to; empty when unencrypted
    pub recipients: Vec<String>,
}

fn is_broken_pipe(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

fn join_stage<T>(name: &str, handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::pipeline(format!("{} stage panicked", name)))?
}

/// Stream `entries` through the pipeline into a spool file at `spool_path`
pub fn run_pipeline(
    entries: Vec<ArchiveEntry>,
    descriptor: &PipelineDescriptor,
    keys: &KeyStore,
    spool_path: &Path,
    abort: &AbortSignal,
) -> Result<PipelineOutput> {
    // Resolved before any thread starts so bad recipients produce no bytes.
    let recipients = resolve_recipients(&descriptor.encryption_recipients, keys)?;
    let recipient_keys: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
    let level = descriptor.compression_level;

    debug!(
        "Pipeline: {} entries, gzip level {}, {} recipient(s)",
        entries.len(),
        level,
        recipient_keys.len()
    );

    let (archive_out, archive_in) = pipe::bounded(PIPE_DEPTH);
    let (sealed_out, mut sealed_in) = pipe::bounded(PIPE_DEPTH);

    let (archived, sealed, spooled) = std::thread::scope(|scope| {
        let archiver = scope.spawn(move || -> Result<BuildSummary> {
            let mut builder = ArchiveBuilder::new(archive_out)?.with_abort(abort.clone());
            for entry in entries {
                builder.append(entry)?;
            }
            let (mut out, summary) = builder.finish()?;
            out.flush()?;
            Ok(summary)
        });

        let sealer = scope.spawn(move || -> Result<()> {
            let mut input = archive_in;
            let encryptor = Encryptor::new(sealed_out, &recipients)?;
            let mut gzip = compressor(encryptor, level);
            io::copy(&mut input, &mut gzip)?;
            let encryptor = gzip.finish()?;
            let mut out = encryptor.finish()?;
            out.flush()?;
            Ok(())
        });

        let spooler = scope.spawn(move || -> Result<SpoolFile> {
            let mut spool = SpoolWriter::create(spool_path)?;
            io::copy(&mut sealed_in, &mut spool)?;
            spool.finish()
        });

        (
            join_stage("archive", archiver),
            join_stage("compress/encrypt", sealer),
            join_stage("spool", spooler),
        )
    });

    let (summary, spool) = match (archived, sealed, spooled) {
        (Ok(summary), Ok(()), Ok(spool)) => (summary, spool),
        (archived, sealed, spooled) => {
            // A failing stage closes its pipes, so its neighbours see
            // BrokenPipe; report the stage that failed first.
            let root = [archived.err(), sealed.err(), spooled.err()]
                .into_iter()
                .flatten()
                .reduce(|first, next| if is_broken_pipe(&first) { next } else { first });
            return Err(root.unwrap_or_else(|| Error::pipeline("pipeline failed")));
        }
    };

    info!(
        "Archived {} entries ({} skipped) into {} sealed bytes",
        summary.entries,
        summary.skipped.len(),
        spool.bytes
    );
    Ok(PipelineOutput {
        spool,
        summary,
        recipients: recipient_keys,
    })
}
