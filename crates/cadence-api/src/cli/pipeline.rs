//! CLI pipeline subcommands: list and validate definitions.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use cadence_core::pipeline::definition::{PipelineError, load_pipeline_file};
use cadence_types::pipeline::{PipelineDefinition, StageSpec};

use crate::state::AppState;

pub fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let pipelines = state.pipelines().context("Failed to read pipelines")?;

    if json {
        let out: Vec<_> = pipelines.iter().map(summary).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if pipelines.is_empty() {
        println!();
        println!("  No pipelines found in {}.", state.pipelines_dir().display());
        println!(
            "  Check a definition with: {}",
            style("cadence validate <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Stages"),
            Cell::new("Description"),
        ]);
    for def in &pipelines {
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(stage_outline(&def.stages)),
            Cell::new(def.description.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_pipeline_file(file).map_err(|e| match e {
        PipelineError::ParseError(msg) => anyhow::anyhow!("Failed to parse pipeline YAML: {msg}"),
        PipelineError::ValidationError(msg) => anyhow::anyhow!("Pipeline validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load pipeline: {other}"),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary(&def))?);
    } else {
        println!();
        println!(
            "  {} Pipeline '{}' is valid",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  Stages: {}", stage_outline(&def.stages));
        println!();
    }

    Ok(())
}

fn summary(def: &PipelineDefinition) -> serde_json::Value {
    json!({
        "name": def.name,
        "description": def.description,
        "stages": def.stages,
    })
}

/// `research -> analysis(market, audience) [review] -> draft [approval]`
fn stage_outline(stages: &[StageSpec]) -> String {
    stages
        .iter()
        .map(|stage| {
            let mut part = stage.name.clone();
            if !stage.branches.is_empty() {
                part.push_str(&format!("({})", stage.branches.join(", ")));
            }
            if let Some(gate) = stage.gate {
                let gate = serde_json::to_value(gate)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                part.push_str(&format!(" [{gate}]"));
            }
            part
        })
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::run::GateKind;

    #[test]
    fn outline_shows_branches_and_gates() {
        let stages = vec![
            StageSpec::single("research"),
            StageSpec::parallel("analysis", &["market", "audience"]).with_gate(GateKind::Review),
            StageSpec::single("draft").with_gate(GateKind::Approval),
        ];
        assert_eq!(
            stage_outline(&stages),
            "research -> analysis(market, audience) [review] -> draft [approval]"
        );
    }

    #[test]
    fn validate_reports_invalid_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, "name: bad\nstages: []\n").unwrap();
        let err = handle_validate(&path, true).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }
}
