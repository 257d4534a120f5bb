//! List command

use anyhow::Result;
use camino::Utf8Path;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use strongbox_backup::Orchestrator;
use strongbox_core::utils::format_bytes;

use super::{load_models, ModelSelection};
use crate::output;

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub selection: ModelSelection,
}

#[derive(Tabled)]
struct SetRow {
    run: String,
    created: String,
    size: String,
    chunks: u64,
    encrypted: &'static str,
    location: String,
}

pub async fn run(args: ListArgs, config: Option<&Utf8Path>) -> Result<()> {
    let (_, models) = load_models(config, &args.selection)?;
    let orchestrator = Orchestrator::new();
    let mut failures = 0;

    for policy in &models {
        for (backend, listing) in orchestrator.list(policy).await {
            output::header(&format!("{} @ {}", policy.name, backend));
            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    output::error(&format!("Could not list {}: {}", backend, e));
                    failures += 1;
                    continue;
                }
            };

            if listing.complete.is_empty() {
                output::info("No complete sets");
            } else {
                let rows: Vec<SetRow> = listing
                    .complete
                    .iter()
                    .map(|set| SetRow {
                        run: set.run_id.to_string(),
                        created: set.manifest.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        size: format_bytes(set.manifest.total_bytes),
                        chunks: set.manifest.total_chunks,
                        encrypted: if set.manifest.encryption.is_some() {
                            "yes"
                        } else {
                            "no"
                        },
                        location: set.location.clone(),
                    })
                    .collect();
                let mut table = Table::new(rows);
                table.with(Style::sharp());
                println!("{}", table);
            }

            for partial in &listing.partial {
                output::warning(&format!(
                    "Partial set {} (no manifest) at {}",
                    partial.run_id, partial.location
                ));
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} destination(s) could not be listed", failures);
    }
    Ok(())
}
