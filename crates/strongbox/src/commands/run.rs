//! Run command

use anyhow::Result;
use camino::Utf8Path;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use strongbox_backup::{BackendStatus, HookOutcome, Orchestrator, RunReport};
use strongbox_core::utils::format_bytes;
use strongbox_core::AbortSignal;

use super::{load_models, ModelSelection};
use crate::output;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: ModelSelection,

    /// Run the selected models concurrently
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Tabled)]
struct BackendRow {
    model: String,
    backend: String,
    kind: &'static str,
    status: String,
    chunks: u64,
    detail: String,
}

pub async fn run(args: RunArgs, config: Option<&Utf8Path>) -> Result<()> {
    let (_, models) = load_models(config, &args.selection)?;

    let abort = AbortSignal::new();
    let on_interrupt = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, stopping after the current step");
            on_interrupt.abort();
        }
    });

    let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    output::header(&format!("Backing up {}", names.join(", ")));

    let spinner = output::spinner("Running backups...");
    let reports = Orchestrator::new()
        .run_all(&models, args.parallel, &abort)
        .await;
    spinner.finish_and_clear();

    for report in &reports {
        print_notes(report);
    }

    let rows: Vec<BackendRow> = reports.iter().flat_map(rows_for).collect();
    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("{}", table);
    }

    let failed: Vec<&RunReport> = reports.iter().filter(|r| !r.is_success()).collect();
    if failed.is_empty() {
        output::success(&format!("{} model(s) backed up", reports.len()));
        return Ok(());
    }
    for report in &failed {
        let reason = report
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "not every destination stored the set".to_string());
        output::error(&format!("{}: {}", report.model, reason));
    }
    std::process::exit(1);
}

fn print_notes(report: &RunReport) {
    for (hook, outcome) in &report.hooks {
        match outcome {
            HookOutcome::Succeeded => {}
            HookOutcome::Skipped { missing } => output::warning(&format!(
                "{}: hook '{}' skipped, {} not found",
                report.model, hook, missing
            )),
            HookOutcome::Failed { message } => output::warning(&format!(
                "{}: hook '{}' failed: {}",
                report.model, hook, message
            )),
        }
    }
    for skipped in &report.skipped {
        output::warning(&format!(
            "{}: skipped {} ({})",
            report.model, skipped.source, skipped.reason
        ));
    }
    if let Some(archive) = &report.archive {
        for skipped in &archive.skipped {
            output::warning(&format!(
                "{}: skipped {} ({})",
                report.model, skipped.path, skipped.reason
            ));
        }
        output::info(&format!(
            "{}: {} entries, {} read, {} stored as {}",
            report.model,
            archive.entries,
            format_bytes(archive.bytes),
            format_bytes(report.bytes),
            report.run_id
        ));
    }
}

fn rows_for(report: &RunReport) -> Vec<BackendRow> {
    report
        .backends
        .iter()
        .map(|backend| {
            let (status, detail) = match (&backend.status, &backend.error) {
                (BackendStatus::Stored, _) => {
                    let mut detail = backend.location.clone().unwrap_or_default();
                    if let Some(pruned) = &backend.prune {
                        if !pruned.deleted.is_empty() {
                            detail.push_str(&format!(" (pruned {})", pruned.deleted.len()));
                        }
                    }
                    if let Some(e) = &backend.prune_error {
                        detail.push_str(&format!(" (prune failed: {})", e));
                    }
                    ("stored", detail)
                }
                (BackendStatus::Failed, error) => (
                    "failed",
                    error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                ),
            };
            BackendRow {
                model: report.model.clone(),
                backend: backend.name.clone(),
                kind: backend.kind,
                status: status.to_string(),
                chunks: backend.chunks,
                detail,
            }
        })
        .collect()
}
