//! CLI command definitions for the `conductor` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod render;
pub mod run;
pub mod runs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run declarative workflows with resumable state.
#[derive(Parser)]
#[command(name = "conductor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (config.toml and run state).
    #[arg(long, global = true, env = "CONDUCTOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file (JSON or YAML).
    Run {
        /// Path to the workflow definition.
        file: PathBuf,

        /// Initial variable, as `name=value`. Values that parse as JSON are
        /// taken as JSON, anything else as a string.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Environment overlay for every step, as `NAME=VALUE`.
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Upper bound on concurrently executing steps.
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Explicit run ID (default: generated).
        #[arg(long)]
        run_id: Option<String>,

        /// Validate and print the execution plan without running.
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a paused or failed run.
    Resume {
        /// Run ID to resume.
        run_id: String,

        /// Workflow definition the run was started from.
        file: PathBuf,

        /// Reason recorded in the resume history.
        #[arg(long, default_value = "manual resume")]
        reason: String,

        /// Upper bound on concurrently executing steps.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// List persisted runs.
    #[command(alias = "ls")]
    States,

    /// Show one persisted run.
    Show {
        /// Run ID to display.
        run_id: String,

        /// Include the run log.
        #[arg(long)]
        logs: bool,
    },

    /// Delete a persisted run and its backups.
    #[command(alias = "rm")]
    Delete {
        /// Run ID to delete.
        run_id: String,
    },

    /// Remove persisted runs older than a maximum age.
    Cleanup {
        /// Maximum age in seconds (default: `max_state_age_ms` from config).
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Split `NAME=VALUE`.
pub fn parse_pair(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected NAME=VALUE, got '{raw}'"))?;
    if name.is_empty() {
        anyhow::bail!("empty name in '{raw}'");
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "conductor", "run", "flow.yaml", "--var", "n=3", "--var", "name=x", "--env", "A=b",
            "--max-concurrency", "2", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { file, vars, env, max_concurrency, .. } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(vars, vec!["n=3", "name=x"]);
                assert_eq!(env, vec!["A=b"]);
                assert_eq!(max_concurrency, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("a=b=c").unwrap(), ("a".into(), "b=c".into()));
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }
}
