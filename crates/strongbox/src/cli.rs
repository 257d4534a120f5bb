//! CLI argument parsing with clap

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

pub use crate::commands::check::CheckArgs;
pub use crate::commands::extract::ExtractArgs;
pub use crate::commands::keygen::KeygenArgs;
pub use crate::commands::list::ListArgs;
pub use crate::commands::prune::PruneArgs;
pub use crate::commands::run::RunArgs;

/// Strongbox - streaming, encrypted backups to many destinations
#[derive(Parser, Debug)]
#[command(name = "strongbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Path to strongbox.yaml
    #[arg(short, long, global = true, env = "STRONGBOX_CONFIG")]
    pub config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up models to every configured destination
    Run(RunArgs),

    /// List stored backup sets
    List(ListArgs),

    /// Apply retention without backing up
    Prune(PruneArgs),

    /// Decrypt and unpack a set from a local destination
    Extract(ExtractArgs),

    /// Generate an age identity for encrypting backups
    Keygen(KeygenArgs),

    /// Validate the configuration and show the resolved models
    Check(CheckArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_accepts_models_and_flags() {
        let cli = Cli::parse_from(["strongbox", "-v", "run", "home", "photos", "--local-only"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.selection.models, vec!["home", "photos"]);
                assert!(args.selection.local_only);
                assert!(!args.parallel);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_extract_requires_output() {
        let parsed = Cli::try_parse_from(["strongbox", "extract", "/backups/home/set"]);
        assert!(parsed.is_err());
    }
}
