//! Prune command

use anyhow::Result;
use camino::Utf8Path;
use clap::Args;

use strongbox_backup::Orchestrator;

use super::{load_models, ModelSelection};
use crate::output;

#[derive(Args, Debug)]
pub struct PruneArgs {
    #[command(flatten)]
    pub selection: ModelSelection,
}

pub async fn run(args: PruneArgs, config: Option<&Utf8Path>) -> Result<()> {
    let (_, models) = load_models(config, &args.selection)?;
    let orchestrator = Orchestrator::new();
    let mut failures = 0;

    for policy in &models {
        let results = orchestrator.prune(policy).await;
        if results.is_empty() {
            output::info(&format!("{}: no destination sets keep", policy.name));
            continue;
        }

        for (backend, result) in results {
            match result {
                Ok(report) => {
                    output::success(&format!(
                        "{} @ {}: kept {}, deleted {}",
                        policy.name,
                        backend,
                        report.kept.len(),
                        report.deleted.len()
                    ));
                    for run in &report.deleted {
                        output::kv("deleted", run.as_str());
                    }
                    for (run, reason) in &report.failed {
                        failures += 1;
                        output::warning(&format!("Could not delete {}: {}", run, reason));
                    }
                }
                Err(e) => {
                    failures += 1;
                    output::error(&format!("{} @ {}: {}", policy.name, backend, e));
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} prune problem(s)", failures);
    }
    Ok(())
}
