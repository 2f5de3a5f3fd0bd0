//! Pipeline definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `PipelineDefinition`, validates structural
//! constraints (unique stage and branch names, name format, timeouts), and
//! discovers pipeline files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cadence_types::pipeline::PipelineDefinition;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading pipeline definitions.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `PipelineDefinition`.
pub fn parse_pipeline_yaml(yaml: &str) -> Result<PipelineDefinition, PipelineError> {
    let def: PipelineDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| PipelineError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_pipeline_yaml(def: &PipelineDefinition) -> Result<String, PipelineError> {
    serde_yaml_ng::to_string(def).map_err(|e| PipelineError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate structural constraints on a `PipelineDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one stage exists
/// - Stage names are identifiers and unique
/// - Branch names are identifiers and unique within their stage
/// - Timeouts are > 0 if set
pub fn validate_definition(def: &PipelineDefinition) -> Result<(), PipelineError> {
    if !is_identifier(&def.name) {
        return Err(PipelineError::ValidationError(format!(
            "pipeline name '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
            def.name
        )));
    }

    if def.stages.is_empty() {
        return Err(PipelineError::ValidationError(
            "pipeline must have at least one stage".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for stage in &def.stages {
        if !is_identifier(&stage.name) {
            return Err(PipelineError::ValidationError(format!(
                "invalid stage name '{}'",
                stage.name
            )));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(PipelineError::ValidationError(format!(
                "duplicate stage name: '{}'",
                stage.name
            )));
        }

        let mut branches = HashSet::new();
        for branch in &stage.branches {
            if !is_identifier(branch) {
                return Err(PipelineError::ValidationError(format!(
                    "stage '{}' has invalid branch name '{}'",
                    stage.name, branch
                )));
            }
            if !branches.insert(branch.as_str()) {
                return Err(PipelineError::ValidationError(format!(
                    "stage '{}' has duplicate branch '{}'",
                    stage.name, branch
                )));
            }
        }

        if stage.timeout_secs == Some(0) {
            return Err(PipelineError::ValidationError(format!(
                "stage '{}' timeout must be > 0",
                stage.name
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a pipeline definition from a YAML file.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineDefinition, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_yaml(&content)
}

/// Save a pipeline definition to a YAML file, creating parent directories.
pub fn save_pipeline_file(path: &Path, def: &PipelineDefinition) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_pipeline_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all pipeline YAML files directly under `base_dir`.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_pipelines(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, PipelineDefinition)>, PipelineError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    for entry in std::fs::read_dir(base_dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_pipeline_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid pipeline file"),
        }
    }
    results.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::pipeline::StageSpec;
    use cadence_types::run::GateKind;

    fn minimal_pipeline(name: &str, stages: Vec<StageSpec>) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            description: None,
            stages,
        }
    }

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = r#"
name: article
description: Long-form article pipeline
stages:
  - name: research
  - name: analysis
    branches: [market, audience, competitors]
    gate: review
  - name: draft
    gate: approval
"#;
        let def = parse_pipeline_yaml(yaml).unwrap();
        assert_eq!(def.stages.len(), 3);

        let out = serialize_pipeline_yaml(&def).unwrap();
        let again = parse_pipeline_yaml(&out).unwrap();
        assert_eq!(again.stages[1].branches.len(), 3);
        assert_eq!(again.stages[2].gate, Some(GateKind::Approval));
    }

    #[test]
    fn test_validation_rejects_duplicate_stage_names() {
        let def = minimal_pipeline(
            "p",
            vec![StageSpec::single("draft"), StageSpec::single("draft")],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate stage"));
    }

    #[test]
    fn test_validation_rejects_duplicate_branches() {
        let def = minimal_pipeline("p", vec![StageSpec::parallel("analysis", &["a", "a"])]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_names() {
        assert!(validate_definition(&minimal_pipeline("", vec![StageSpec::single("a")])).is_err());
        assert!(validate_definition(&minimal_pipeline("p q", vec![StageSpec::single("a")])).is_err());
        assert!(validate_definition(&minimal_pipeline("p", vec![StageSpec::single("a/b")])).is_err());
        assert!(
            validate_definition(&minimal_pipeline("p", vec![StageSpec::parallel("x", &[".."])]))
                .is_err()
        );
    }

    #[test]
    fn test_validation_rejects_empty_pipeline() {
        assert!(validate_definition(&minimal_pipeline("p", vec![])).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut stage = StageSpec::single("draft");
        stage.timeout_secs = Some(0);
        assert!(validate_definition(&minimal_pipeline("p", vec![stage])).is_err());
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = minimal_pipeline("article", vec![StageSpec::single("draft")]);
        save_pipeline_file(&dir.path().join("article.yaml"), &def).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_pipeline_file(&dir.path().join("article.yaml")).unwrap();
        assert_eq!(loaded.name, "article");

        let found = discover_pipelines(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "article");
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_pipelines(Path::new("/nonexistent/cadence/pipelines")).unwrap();
        assert!(found.is_empty());
    }
}
