//! Keygen command

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Args;

use strongbox_backup::encryption::write_identity_file;

use crate::output;

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the identity (created with mode 0600)
    #[arg(short, long)]
    pub output: Utf8PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: KeygenArgs) -> Result<()> {
    let recipient = write_identity_file(args.output.as_std_path(), args.force)
        .with_context(|| format!("Failed to write {}", args.output))?;

    output::success(&format!("Identity written to {}", args.output));
    output::kv("Public key", &recipient);
    output::info("Add the public key under `keys:` in strongbox.yaml and keep the file safe");
    Ok(())
}
