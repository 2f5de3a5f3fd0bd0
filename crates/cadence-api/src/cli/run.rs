//! CLI run subcommands: submit, drive, status, steps, resume, delete, recover.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use cadence_core::repository::pipeline::PipelineRepository;
use cadence_types::event::PipelineEvent;
use cadence_types::run::{Run, RunStatus};
use cadence_types::step::{AttemptStatus, StepStatus};

use super::{parse_run_id, short_id};
use crate::state::{AppState, Engine};

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

pub async fn handle_submit(
    state: &AppState,
    pipeline_name: &str,
    config: Option<&str>,
    config_file: Option<&Path>,
    no_drive: bool,
    json: bool,
) -> Result<()> {
    let config = read_run_config(config, config_file).await?;
    let pipeline = state.find_pipeline(pipeline_name)?;
    let engine = state.engine(pipeline).await?;

    let run = engine
        .submit(state.tenant.clone(), config)
        .await
        .context("Failed to create run")?;

    if !json {
        println!();
        println!(
            "  {} Submitted run of '{}'",
            style("*").green().bold(),
            style(&run.pipeline).cyan()
        );
        println!("  Run ID: {}", run.id);
        println!("  Tenant: {}", run.tenant);
    }

    if no_drive {
        if json {
            println!("{}", serde_json::to_string_pretty(&run)?);
        } else {
            println!();
            println!(
                "  Start it with: {}",
                style(format!("cadence drive {}", run.id)).dim()
            );
            println!();
        }
        return Ok(());
    }

    drive_and_report(state, &engine, run.id, json).await
}

async fn read_run_config(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => return Ok(json!({})),
    };
    let value: Value = serde_json::from_str(&raw).context("Invalid JSON run configuration")?;
    if !value.is_object() {
        bail!("Run configuration must be a JSON object");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Drive
// ---------------------------------------------------------------------------

pub async fn handle_drive(state: &AppState, run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (engine, _) = state.engine_for_run(run_id).await?;
    drive_and_report(state, &engine, run_id, json).await
}

/// Drive a run, printing engine events as they happen, then show where it stopped.
pub async fn drive_and_report(
    state: &AppState,
    engine: &Engine,
    run_id: Uuid,
    json: bool,
) -> Result<()> {
    let mut events = state.events.subscribe_run(run_id);
    let drive = engine.drive(run_id);
    tokio::pin!(drive);

    if !json {
        println!();
    }
    let outcome = loop {
        tokio::select! {
            outcome = &mut drive => break outcome,
            received = events.recv() => match received {
                Ok(event) => {
                    if !json {
                        print_event(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break (&mut drive).await,
            },
        }
    };
    // Events published just before the drive returned.
    while let Ok(event) = events.try_recv() {
        if !json {
            print_event(&event);
        }
    }

    outcome.with_context(|| format!("Failed to drive run '{}'", short_id(&run_id)))?;
    let run = state.get_run(run_id).await?;
    display_run(&run, json)
}

fn print_event(event: &PipelineEvent) {
    let Some((marker, line)) = describe_event(event) else {
        return;
    };
    let marker = match marker {
        "*" => style(marker).green().bold(),
        "x" => style(marker).red().bold(),
        "!" => style(marker).yellow().bold(),
        _ => style(marker).dim(),
    };
    println!("  {marker} {line}");
}

/// One progress line per event: a marker and a description. Heartbeats are silent.
pub fn describe_event(event: &PipelineEvent) -> Option<(&'static str, String)> {
    let described = match event {
        PipelineEvent::RunStarted { pipeline, .. } => (">", format!("Run started ({pipeline})")),
        PipelineEvent::StageStarted {
            stage, attempt_num, ..
        } => (">", format!("{stage}: attempt {attempt_num}")),
        PipelineEvent::StageCompleted {
            stage,
            digest,
            duration_ms,
            ..
        } => (
            "*",
            format!("{stage}: completed in {duration_ms}ms ({})", digest.short()),
        ),
        PipelineEvent::StageCacheHit { stage, digest, .. } => {
            ("=", format!("{stage}: reused {}", digest.short()))
        }
        PipelineEvent::StageFailed {
            stage,
            classification,
            error,
            will_retry,
            ..
        } => {
            let next = if *will_retry { "retrying" } else { "giving up" };
            ("x", format!("{stage}: {classification}: {error} ({next})"))
        }
        PipelineEvent::Heartbeat { .. } => return None,
        PipelineEvent::RunSuspended { status, stage, .. } => match stage {
            Some(stage) => ("-", format!("Waiting ({status}) after {stage}")),
            None => ("-", format!("Waiting ({status})")),
        },
        PipelineEvent::RunCompleted { duration_ms, .. } => {
            ("*", format!("Run completed in {duration_ms}ms"))
        }
        PipelineEvent::RunFailed { code, error, .. } => ("x", format!("Run failed [{code}]: {error}")),
        PipelineEvent::RunCancelled { .. } => ("!", "Run cancelled".to_string()),
        PipelineEvent::SignalIgnored { signal, status, .. } => {
            ("!", format!("Signal '{signal}' ignored while {status}"))
        }
        PipelineEvent::RunForked {
            run_id, from_stage, ..
        } => ("*", format!("Forked run {run_id} from '{from_stage}'")),
    };
    Some(described)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(
    state: &AppState,
    run_id: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    if let Some(raw) = run_id {
        let run = state.get_run(parse_run_id(raw)?).await?;
        return display_run(&run, json);
    }

    let runs = state
        .repository()
        .await?
        .list_runs(Some(&state.tenant), limit)
        .await
        .map_err(|e| anyhow!("Failed to list runs: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for tenant '{}'.", state.tenant);
        println!(
            "  Start one with: {}",
            style("cadence submit <pipeline>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Pipeline"),
            Cell::new("Status"),
            Cell::new("Stage"),
            Cell::new("Created"),
            Cell::new("Parent"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            Cell::new(&run.pipeline),
            format_status(run.status),
            Cell::new(run.current_stage.as_deref().unwrap_or("-")),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(run.parent_run_id.as_ref().map(short_id).unwrap_or_else(|| "-".to_string())),
        ]);
    }

    println!();
    println!("  Runs for tenant '{}'", style(&state.tenant).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

fn display_run(run: &Run, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Run:").bold(),
        style(run.id).cyan()
    );
    println!("  Pipeline: {}", style(&run.pipeline).cyan());
    println!("  Status: {}", run.status);
    if let Some(stage) = &run.current_stage {
        println!("  Stage: {stage}");
    }
    if let Some(gate) = &run.gate {
        println!(
            "  Gate: {:?} on '{}' (iteration {})",
            gate.kind, gate.stage, gate.iteration
        );
    }
    if let Some(parent) = run.parent_run_id {
        println!(
            "  Forked from: {} at '{}'",
            parent,
            run.resumed_from.as_deref().unwrap_or("-")
        );
    }
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &run.error {
        println!("  Error: {} [{}]", style(&err.message).red(), err.code);
        if let Some(stage) = &err.stage {
            println!("  Failed stage: {stage}");
        }
        if let Some(class) = err.classification {
            println!("  Classification: {class}");
        }
        println!("  Attempts: {}", err.attempts);
    }
    if let Some(hint) = next_step_hint(run) {
        println!();
        println!("  Next: {}", style(hint).dim());
    }
    println!();

    Ok(())
}

/// The command a user most likely wants next for a run in this state.
fn next_step_hint(run: &Run) -> Option<String> {
    let id = run.id;
    match run.status {
        RunStatus::Pending | RunStatus::Running => Some(format!("cadence drive {id}")),
        RunStatus::WaitingApproval => Some(format!(
            "cadence signal {id} approve | reject --reason <text> | rework --stage <stage>=<instruction>"
        )),
        RunStatus::WaitingReview => Some(format!(
            "cadence signal {id} review --accept <step> --retry <step>=<instruction>"
        )),
        RunStatus::Paused => Some(format!("cadence signal {id} continue")),
        RunStatus::Failed | RunStatus::Cancelled => {
            Some(format!("cadence resume {id} <stage>"))
        }
        RunStatus::Completed => None,
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub async fn handle_steps(
    state: &AppState,
    run_id_str: &str,
    all_attempts: bool,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let repo = state.repository().await?;
    // Fails fast with a clear message for unknown runs.
    state.get_run(run_id).await?;

    let steps = repo
        .list_steps(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to list steps: {e}"))?;
    let mut step_attempts = Vec::with_capacity(steps.len());
    for step in &steps {
        let attempts = repo
            .list_attempts(&step.id)
            .await
            .map_err(|e| anyhow!("Failed to list attempts: {e}"))?;
        step_attempts.push(attempts);
    }
    let artifacts = repo
        .list_artifacts(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to list artifacts: {e}"))?;

    if json {
        let out: Vec<_> = steps
            .iter()
            .zip(&step_attempts)
            .map(|(step, attempts)| json!({ "step": step, "attempts": attempts }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "steps": out, "artifacts": artifacts }))?
        );
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  No steps yet for run '{}'.", short_id(&run_id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Rev"),
            Cell::new("Retries"),
            Cell::new("Attempt"),
            Cell::new("Result"),
            Cell::new("Duration"),
            Cell::new("Output"),
            Cell::new("Error"),
        ]);

    for (step, attempts) in steps.iter().zip(&step_attempts) {
        let shown: Vec<_> = if all_attempts {
            attempts.iter().collect()
        } else {
            attempts.last().into_iter().collect()
        };

        if shown.is_empty() {
            table.add_row(vec![
                Cell::new(&step.stage_name),
                format_step_status(step.status),
                Cell::new(step.revision),
                Cell::new(step.retry_count),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new(step.error_code.as_deref().unwrap_or("-")),
            ]);
            continue;
        }

        for attempt in shown {
            let duration = attempt
                .duration_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            let output = attempt
                .output_digest
                .as_ref()
                .map(|d| d.short().to_string())
                .unwrap_or_else(|| "-".to_string());
            let error = attempt
                .error
                .as_ref()
                .map(|e| e.chars().take(40).collect::<String>())
                .unwrap_or_else(|| "-".to_string());

            table.add_row(vec![
                Cell::new(&step.stage_name),
                format_step_status(step.status),
                Cell::new(step.revision),
                Cell::new(step.retry_count),
                Cell::new(attempt.attempt_num),
                format_attempt_status(attempt.status),
                Cell::new(duration),
                Cell::new(output),
                Cell::new(error),
            ]);
        }
    }

    println!();
    println!("  Steps for run '{}'", style(short_id(&run_id)).cyan());
    println!();
    println!("{table}");

    if !artifacts.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Artifact").fg(Color::Cyan),
                Cell::new("Type"),
                Cell::new("Size"),
                Cell::new("Digest"),
            ]);
        for artifact in &artifacts {
            table.add_row(vec![
                Cell::new(&artifact.stage_name),
                Cell::new(&artifact.artifact_type),
                Cell::new(format!("{} B", artifact.size_bytes)),
                Cell::new(artifact.digest.short()),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    run_id_str: &str,
    stage: &str,
    no_drive: bool,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (engine, _) = state.engine_for_run(run_id).await?;

    let fork = engine
        .resume_from(run_id, stage)
        .await
        .with_context(|| format!("Failed to resume run '{}' from '{stage}'", short_id(&run_id)))?;

    if !json {
        println!();
        println!(
            "  {} Forked run '{}' from '{}'",
            style("*").green().bold(),
            style(short_id(&run_id)).cyan(),
            style(stage).cyan()
        );
        println!("  New run ID: {}", fork.id);
    }

    if no_drive {
        if json {
            println!("{}", serde_json::to_string_pretty(&fork)?);
        } else {
            println!();
        }
        return Ok(());
    }
    drive_and_report(state, &engine, fork.id, json).await
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn handle_delete(state: &AppState, run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (engine, _) = state.engine_for_run(run_id).await?;

    let report = engine
        .delete_run(run_id)
        .await
        .with_context(|| format!("Failed to delete run '{}'", short_id(&run_id)))?;

    if json {
        println!(
            "{}",
            json!({
                "deleted": run_id.to_string(),
                "pointers_removed": report.pointers_removed,
                "blobs_removed": report.blobs_removed,
                "blobs_shared": report.blobs_shared,
            })
        );
    } else {
        println!();
        println!(
            "  {} Deleted run '{}'",
            style("*").green().bold(),
            style(short_id(&run_id)).cyan()
        );
        println!(
            "  Artifacts: {} removed, {} kept (shared with other runs)",
            report.blobs_removed, report.blobs_shared
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn handle_recover(state: &AppState, json: bool) -> Result<()> {
    let pipelines = state.pipelines().context("Failed to read pipelines")?;

    let mut results = Vec::new();
    for pipeline in pipelines {
        let name = pipeline.name.clone();
        let engine = state.engine(pipeline).await?;
        let recovered = engine
            .recover()
            .await
            .with_context(|| format!("Failed to recover runs of '{name}'"))?;
        results.extend(recovered.into_iter().map(|(id, outcome)| (name.clone(), id, outcome)));
    }

    if json {
        let out: Vec<_> = results
            .iter()
            .map(|(pipeline, id, outcome)| match outcome {
                Ok(status) => json!({ "run_id": id.to_string(), "pipeline": pipeline, "status": status }),
                Err(error) => json!({ "run_id": id.to_string(), "pipeline": pipeline, "error": error }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if results.is_empty() {
        println!("  No interrupted runs for tenant '{}'.", state.tenant);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Pipeline"),
            Cell::new("Outcome"),
        ]);
    for (pipeline, id, outcome) in &results {
        let outcome = match outcome {
            Ok(status) => format_status(*status),
            Err(error) => Cell::new(error).fg(Color::Red),
        };
        table.add_row(vec![Cell::new(short_id(id)), Cell::new(pipeline), outcome]);
    }
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_status(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::WaitingApproval | RunStatus::WaitingReview => Color::Magenta,
        RunStatus::Paused => Color::DarkYellow,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

fn format_step_status(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending | StepStatus::Skipped => Color::Yellow,
        StepStatus::Running => Color::Blue,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn format_attempt_status(status: AttemptStatus) -> Cell {
    let color = match status {
        AttemptStatus::Running => Color::Blue,
        AttemptStatus::Succeeded => Color::Green,
        AttemptStatus::Failed => Color::Red,
        AttemptStatus::Abandoned => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::artifact::Digest;
    use cadence_types::failure::FailureClass;
    use cadence_types::run::TenantId;

    #[test]
    fn heartbeats_are_not_printed() {
        let event = PipelineEvent::Heartbeat {
            run_id: Uuid::now_v7(),
            stage: "draft".to_string(),
            attempt_id: Uuid::now_v7(),
        };
        assert!(describe_event(&event).is_none());
    }

    #[test]
    fn stage_events_describe_progress() {
        let run_id = Uuid::now_v7();
        let digest = Digest::from_bytes(b"body");
        let (marker, line) = describe_event(&PipelineEvent::StageCompleted {
            run_id,
            stage: "analysis/market".to_string(),
            digest: digest.clone(),
            duration_ms: 42,
        })
        .unwrap();
        assert_eq!(marker, "*");
        assert!(line.starts_with("analysis/market: completed in 42ms"));
        assert!(line.contains(digest.short()));

        let (marker, line) = describe_event(&PipelineEvent::StageFailed {
            run_id,
            stage: "draft".to_string(),
            classification: FailureClass::Retryable,
            error: "rate limited".to_string(),
            will_retry: true,
        })
        .unwrap();
        assert_eq!(marker, "x");
        assert!(line.ends_with("(retrying)"));
    }

    #[test]
    fn hints_follow_run_status() {
        let mut run = Run::new(TenantId::new("acme"), "article", json!({}));
        run.status = RunStatus::WaitingReview;
        assert!(next_step_hint(&run).unwrap().contains("review --accept"));
        run.status = RunStatus::Failed;
        assert!(next_step_hint(&run).unwrap().starts_with("cadence resume"));
        run.status = RunStatus::Completed;
        assert!(next_step_hint(&run).is_none());
    }

    #[tokio::test]
    async fn run_config_must_be_an_object() {
        assert_eq!(read_run_config(None, None).await.unwrap(), json!({}));
        assert_eq!(
            read_run_config(Some(r#"{"topic":"tides"}"#), None).await.unwrap()["topic"],
            "tides"
        );
        assert!(read_run_config(Some("[1,2]"), None).await.is_err());
        assert!(read_run_config(Some("{"), None).await.is_err());

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("run.json");
        tokio::fs::write(&path, r#"{"audience":"engineers"}"#).await.unwrap();
        let config = read_run_config(None, Some(&path)).await.unwrap();
        assert_eq!(config["audience"], "engineers");
    }
}
