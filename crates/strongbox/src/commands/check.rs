//! Check command

use anyhow::Result;
use camino::Utf8Path;
use clap::Args;

use strongbox_core::types::SourceSpec;
use strongbox_core::utils::format_bytes;

use super::{load_models, ModelSelection};
use crate::output;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub selection: ModelSelection,
}

pub fn run(args: CheckArgs, config: Option<&Utf8Path>) -> Result<()> {
    let (loaded, models) = load_models(config, &args.selection)?;
    output::success(&format!("{} is valid", loaded.config_path));

    for policy in &models {
        output::header(&policy.name);
        if let Some(description) = &policy.description {
            output::kv("Description", description);
        }
        output::kv("Hooks", &policy.hooks.len().to_string());
        for source in &policy.sources {
            let kind = match source {
                SourceSpec::Path(_) => "path",
                SourceSpec::Glob(_) => "glob",
                SourceSpec::Command(_) => "command",
            };
            let marker = if source.is_mandatory() { "" } else { " (optional)" };
            output::kv(kind, &format!("{}{}", source.describe(), marker));
        }
        output::kv(
            "Compression",
            &format!("gzip level {}", policy.pipeline.compression_level),
        );
        output::kv(
            "Encryption",
            &if policy.pipeline.is_encrypted() {
                format!("age, {} recipient(s)", policy.pipeline.encryption_recipients.len())
            } else {
                "none".to_string()
            },
        );
        for storage in &policy.storage {
            let keep = storage
                .keep()
                .map(|k| format!("keep {}", k))
                .unwrap_or_else(|| "keep all".to_string());
            let chunk = format_bytes(storage.chunk_size(policy.pipeline.chunk_size_bytes));
            output::kv(
                &storage.name(),
                &format!("{}, {} chunks, {}", storage.kind(), chunk, keep),
            );
        }
    }
    Ok(())
}
