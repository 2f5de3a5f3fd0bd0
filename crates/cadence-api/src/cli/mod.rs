//! CLI command definitions and dispatch for the `cadence` binary.
//!
//! Uses clap derive macros for argument parsing. Run commands take a run UUID;
//! `--tenant` selects which tenant database they operate on.

pub mod pipeline;
pub mod run;
pub mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable multi-stage content pipelines with human review gates.
#[derive(Parser)]
#[command(name = "cadence", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Tenant whose runs are addressed.
    #[arg(long, global = true, env = "CADENCE_TENANT", default_value = "default")]
    pub tenant: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run of a pipeline and drive it until it waits or finishes.
    Submit {
        /// Pipeline name.
        pipeline: String,

        /// Run configuration as a JSON object.
        #[arg(long, conflicts_with = "config_file")]
        config: Option<String>,

        /// Read the run configuration from a JSON file.
        #[arg(long)]
        config_file: Option<PathBuf>,

        /// Only create the run; do not execute any stage.
        #[arg(long)]
        no_drive: bool,
    },

    /// Drive a run until it waits for a signal or reaches a terminal state.
    Drive {
        /// Run UUID.
        run_id: String,
    },

    /// Deliver a signal to a run, then drive it.
    Signal {
        /// Run UUID.
        run_id: String,

        /// Delivery id for idempotent redelivery (defaults to a fresh UUID).
        #[arg(long)]
        delivery_id: Option<String>,

        /// Only record the signal; do not drive the run.
        #[arg(long)]
        no_drive: bool,

        #[command(subcommand)]
        signal: signal::SignalCommand,
    },

    /// Show one run, or recent runs of the tenant.
    Status {
        /// Run UUID (omit to list runs).
        run_id: Option<String>,

        /// Maximum number of runs to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the steps, attempts and artifacts of a run.
    Steps {
        /// Run UUID.
        run_id: String,

        /// Include every attempt, not only the latest per step.
        #[arg(long)]
        attempts: bool,
    },

    /// Fork a run from a stage, sharing the artifacts of earlier stages.
    Resume {
        /// Run UUID.
        run_id: String,

        /// Stage to restart from.
        stage: String,

        /// Only create the fork; do not drive it.
        #[arg(long)]
        no_drive: bool,
    },

    /// Delete a run and the artifacts no other run references.
    #[command(alias = "rm")]
    Delete {
        /// Run UUID.
        run_id: String,
    },

    /// Re-drive runs interrupted by a crash.
    Recover,

    /// List the pipelines found in the data directory.
    Pipelines,

    /// Validate a pipeline YAML file.
    Validate {
        /// Path to the pipeline YAML file.
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse a run id argument.
pub fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    use anyhow::Context;
    raw.parse()
        .with_context(|| format!("Invalid run ID: '{raw}'"))
}

/// First eight characters of an id, for tables.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_signal_with_global_flags() {
        let cli = Cli::try_parse_from([
            "cadence",
            "--tenant",
            "acme",
            "signal",
            "0195f2a0-0000-7000-8000-000000000000",
            "--json",
            "retry",
            "draft",
            "--instruction",
            "shorter",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.tenant, "acme");
        match cli.command {
            Commands::Signal { signal, no_drive, .. } => {
                assert!(!no_drive);
                assert!(matches!(signal, signal::SignalCommand::Retry { .. }));
            }
            _ => panic!("expected signal command"),
        }
    }

    #[test]
    fn config_and_config_file_conflict() {
        let result = Cli::try_parse_from([
            "cadence",
            "submit",
            "article",
            "--config",
            "{}",
            "--config-file",
            "run.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn run_ids_are_validated() {
        assert!(parse_run_id("not-a-uuid").is_err());
        let id = parse_run_id("0195f2a0-0000-7000-8000-000000000000").unwrap();
        assert_eq!(short_id(&id), "0195f2a0");
    }
}
