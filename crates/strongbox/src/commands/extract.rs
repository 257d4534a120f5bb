//! Extract command

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Args;

use strongbox_backup::encryption::load_identities;
use strongbox_backup::{extract_set, verify_set};
use strongbox_core::utils::format_bytes;

use crate::output;

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Set directory at a local destination (`<path>/<model>/<run>`)
    pub set_dir: Utf8PathBuf,

    /// Age identity file; required for encrypted sets
    #[arg(short, long)]
    pub identity: Option<Utf8PathBuf>,

    /// Directory to unpack into
    #[arg(short, long)]
    pub output: Utf8PathBuf,

    /// Only verify the stored data against its manifest
    #[arg(long)]
    pub verify_only: bool,
}

pub async fn run(args: ExtractArgs) -> Result<()> {
    output::header("Extract Backup Set");
    output::kv("Set", args.set_dir.as_str());

    let set_dir = args.set_dir.clone();
    let spinner = output::spinner("Verifying checksum...");
    let verified = tokio::task::spawn_blocking(move || verify_set(set_dir.as_std_path())).await?;
    spinner.finish_and_clear();
    let (manifest, _) = verified.context("Set failed verification")?;

    output::kv("Model", &manifest.model_name);
    output::kv("Run", manifest.run_id.as_str());
    output::kv("Size", &format_bytes(manifest.total_bytes));
    output::success("Checksum matches manifest");
    if args.verify_only {
        return Ok(());
    }

    let identities = match &args.identity {
        Some(path) => load_identities(path.as_std_path())
            .with_context(|| format!("Failed to read identity file {}", path))?,
        None => Vec::new(),
    };

    let spinner = output::spinner("Extracting...");
    let set_dir = args.set_dir.clone();
    let target = args.output.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        extract_set(set_dir.as_std_path(), &identities, target.as_std_path())
    })
    .await?;
    spinner.finish_and_clear();
    let report = extracted.context("Extraction failed")?;

    output::success(&format!(
        "Extracted {} entries ({}) into {}",
        report.entries,
        format_bytes(report.bytes),
        args.output
    ));
    Ok(())
}
