//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackwarden - Declarative infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "stackwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, env = "STACKWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute. Defaults to `up`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Converge the stack toward the stack file.
    Up,

    /// Read live values into stored state without changing resources.
    Refresh,

    /// Delete every recorded resource and the stored state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show what `up` (or `destroy`) would do.
    Preview {
        /// Preview a destroy instead of an up.
        #[arg(long)]
        destroy: bool,
    },

    /// Inspect or repair stored state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum StateCommands {
    /// Show the stored stack. Sensitive values are masked.
    Show,

    /// Show or clear the stack lock.
    Unlock {
        /// Remove the lock even if another process holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Plain text log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The command to run, `up` when none was given.
    #[must_use]
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_up() {
        let cli = Cli::try_parse_from(["stackwarden"]).unwrap();
        assert_eq!(cli.command(), Commands::Up);
        assert_eq!(cli.output, OutputFormat::Text);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stackwarden",
            "preview",
            "--destroy",
            "--output",
            "json",
            "--log-format",
            "json",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.command(), Commands::Preview { destroy: true });
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.verbose);
    }

    #[test]
    fn test_state_unlock_force() {
        let cli = Cli::try_parse_from(["stackwarden", "state", "unlock", "--force"]).unwrap();
        assert_eq!(
            cli.command(),
            Commands::State {
                command: StateCommands::Unlock { force: true }
            }
        );
    }
}
