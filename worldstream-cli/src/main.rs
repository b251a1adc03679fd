//! WorldStream CLI - Command-line interface
//!
//! Drives the streaming engine against a synthetic world and manages the
//! configuration file and region snapshots.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::simulate::SimulateArgs;
use commands::snapshots::SnapshotAction;

#[derive(Debug, Parser)]
#[command(name = "worldstream", version, about = "Asset streaming and region synchronization engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk a viewer through a generated world and report engine statistics
    Simulate(SimulateArgs),

    /// View and modify configuration settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect or clear persisted region snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args),
        Commands::Config { command } => commands::config::run(command),
        Commands::Snapshots { action } => commands::snapshots::run(action),
    };

    if let Err(e) = result {
        e.exit();
    }
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
    fn test_parse_simulate_flags() {
        let cli = Cli::try_parse_from([
            "worldstream",
            "simulate",
            "--regions",
            "25",
            "--ticks",
            "10",
            "--speed",
            "3.5",
        ])
        .unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.regions, 25);
        assert_eq!(args.ticks, 10);
        assert_eq!(args.speed, 3.5);
    }

    #[test]
    fn test_parse_config_set() {
        let cli = Cli::try_parse_from(["worldstream", "config", "set", "streaming.radius", "300"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommands::Set { .. }
            }
        ));
    }
}
