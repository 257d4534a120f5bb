//! Strongbox CLI - streaming, encrypted backups to many destinations
//!
//! This is the main entry point for the strongbox command-line interface.

mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

/// Exit status for configuration problems
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    // Initialize rustls crypto provider (required for rustls 0.23+)
    // This must be done before any TLS operations
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Err(e) = dispatch(cli).await {
        output::error(&format!("{:#}", e));
        let config_error = e
            .downcast_ref::<strongbox_core::Error>()
            .is_some_and(|e| e.is_config_error());
        std::process::exit(if config_error { EXIT_CONFIG } else { 1 });
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::List(args) => commands::list::run(args, config).await,
        Commands::Prune(args) => commands::prune::run(args, config).await,
        Commands::Extract(args) => commands::extract::run(args).await,
        Commands::Keygen(args) => commands::keygen::run(args),
        Commands::Check(args) => commands::check::run(args, config),
    }
}

/// Initialize tracing with appropriate verbosity
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            // Lifecycle messages by default, -v/-vv for per-chunk detail
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
