//! CLI signal subcommands: translate arguments into a `Signal` and deliver it.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use console::style;

use cadence_types::signal::{Signal, SignalEnvelope, StageReview};

use super::{parse_run_id, short_id};
use crate::cli::run::drive_and_report;
use crate::state::AppState;

/// Signals a run accepts.
#[derive(Subcommand)]
pub enum SignalCommand {
    /// Approve the open gate.
    Approve,

    /// Reject the open gate, failing the run.
    Reject {
        /// Why the output was rejected.
        #[arg(long)]
        reason: String,
    },

    /// Reject and re-run named stages with instructions (`stage=instruction`).
    Rework {
        /// Repeatable `stage=instruction` pair; a parallel stage name targets all branches.
        #[arg(long = "stage", value_name = "STAGE=INSTRUCTION", required = true)]
        stages: Vec<String>,
    },

    /// Review individual steps of a parallel stage.
    Review {
        /// Accept a step.
        #[arg(long, value_name = "STEP")]
        accept: Vec<String>,

        /// Retry a step, optionally with an instruction (`step[=instruction]`).
        #[arg(long, value_name = "STEP[=INSTRUCTION]")]
        retry: Vec<String>,

        /// Refuse a step outright, failing the run.
        #[arg(long, value_name = "STEP")]
        refuse: Vec<String>,
    },

    /// Re-run one completed stage (and everything after it).
    Retry {
        /// Stage or `stage/branch` step name.
        stage: String,

        /// Correction instruction for the re-run.
        #[arg(long)]
        instruction: Option<String>,
    },

    /// Fork the run from a stage (terminal or waiting runs).
    ResumeFrom {
        stage: String,
    },

    /// Pause at the next stage boundary.
    Pause,

    /// Continue a paused run.
    Continue,

    /// Cancel the run.
    Cancel,
}

impl SignalCommand {
    pub fn into_signal(self) -> Result<Signal> {
        let signal = match self {
            SignalCommand::Approve => Signal::Approve,
            SignalCommand::Reject { reason } => Signal::Reject { reason },
            SignalCommand::Rework { stages } => {
                let mut per_stage = BTreeMap::new();
                for raw in stages {
                    let (stage, instruction) = split_pair(&raw);
                    let instruction = instruction
                        .with_context(|| format!("Expected STAGE=INSTRUCTION, got '{raw}'"))?;
                    per_stage.insert(stage, instruction);
                }
                Signal::RejectWithInstructions { per_stage }
            }
            SignalCommand::Review {
                accept,
                retry,
                refuse,
            } => {
                let mut reviews: Vec<StageReview> = accept
                    .into_iter()
                    .map(|stage| StageReview {
                        stage,
                        accepted: true,
                        retry: false,
                        instruction: None,
                    })
                    .collect();
                reviews.extend(retry.iter().map(|raw| {
                    let (stage, instruction) = split_pair(raw);
                    StageReview {
                        stage,
                        accepted: false,
                        retry: true,
                        instruction,
                    }
                }));
                reviews.extend(refuse.into_iter().map(|stage| StageReview {
                    stage,
                    accepted: false,
                    retry: false,
                    instruction: None,
                }));
                if reviews.is_empty() {
                    bail!("A review needs at least one --accept, --retry or --refuse");
                }
                Signal::StageReview { reviews }
            }
            SignalCommand::Retry { stage, instruction } => Signal::RetryStage { stage, instruction },
            SignalCommand::ResumeFrom { stage } => Signal::ResumeFrom { stage },
            SignalCommand::Pause => Signal::Pause,
            SignalCommand::Continue => Signal::Continue,
            SignalCommand::Cancel => Signal::Cancel,
        };
        Ok(signal)
    }
}

/// Split `name=value`; a bare `name` has no value.
fn split_pair(raw: &str) -> (String, Option<String>) {
    match raw.split_once('=') {
        Some((name, value)) => (name.trim().to_string(), Some(value.trim().to_string())),
        None => (raw.trim().to_string(), None),
    }
}

/// Deliver a signal and, unless `no_drive`, drive the run afterwards.
pub async fn handle_signal(
    state: &AppState,
    run_id_str: &str,
    delivery_id: Option<&str>,
    command: SignalCommand,
    no_drive: bool,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let signal = command.into_signal()?;
    let envelope = match delivery_id {
        Some(raw) => SignalEnvelope {
            delivery_id: raw
                .parse()
                .with_context(|| format!("Invalid delivery ID: '{raw}'"))?,
            signal,
        },
        None => SignalEnvelope::new(signal),
    };

    let (engine, _) = state.engine_for_run(run_id).await?;
    let recorded = engine
        .deliver(run_id, envelope.clone())
        .await
        .context("Failed to deliver signal")?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "run_id": run_id.to_string(),
                "delivery_id": envelope.delivery_id.to_string(),
                "signal": envelope.signal,
                "recorded": recorded,
            })
        );
    } else if recorded {
        println!();
        println!(
            "  {} Sent '{}' to run '{}'",
            style("*").green().bold(),
            style(envelope.signal.kind()).cyan(),
            style(short_id(&run_id)).cyan()
        );
    } else {
        println!();
        println!(
            "  {} Delivery {} was already recorded; nothing new to apply",
            style("-").yellow().bold(),
            envelope.delivery_id
        );
    }

    if no_drive {
        if !json {
            println!();
        }
        return Ok(());
    }
    drive_and_report(state, &engine, run_id, json).await
}
