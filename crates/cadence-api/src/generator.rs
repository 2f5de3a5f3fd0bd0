//! Text generation backends and per-stage bindings for the CLI.
//!
//! Each pipeline stage is bound to a [`GenerativeStage`] whose prompt comes
//! from `{data_dir}/prompts/{pipeline}/{stage}.toml` (or
//! `{stage}/{branch}.toml` for one branch of a parallel stage):
//!
//! ```toml
//! prompt = "Research {{topic}} and list primary sources."
//! required_sections = ["Summary", "Sources"]
//! artifact_type = "markdown"
//! ```
//!
//! The generator is an external command (`CADENCE_GENERATOR`) fed the prompt
//! on stdin, or an offline generator that produces a placeholder document.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use cadence_core::pipeline::generative::{
    GenerationRequest, GenerationResponse, GenerativeStage, TextGenerator, TokenUsage,
};
use cadence_core::pipeline::stage::StageRegistry;
use cadence_types::failure::StageError;
use cadence_types::pipeline::PipelineDefinition;
use cadence_types::step::branch_stage_name;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

/// Environment variable holding the generator shell command.
pub const GENERATOR_ENV: &str = "CADENCE_GENERATOR";

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Runs a shell command per request: prompt on stdin, document on stdout.
///
/// The request parameters are exported as JSON in
/// `CADENCE_GENERATION_PARAMS`. Exit codes follow `sysexits.h` so the engine
/// can classify failures: 75 (temporary failure) and 69 (unavailable) are
/// retried, 77 (permission) and 78 (configuration) are not.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl TextGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, StageError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CADENCE_GENERATION_PARAMS", request.parameters.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageError::Configuration(format!("failed to start '{}': {e}", self.command))
            })?;

        // Feed stdin from a separate task so a chatty child cannot deadlock on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = request.prompt.clone().into_bytes();
            tokio::spawn(async move { stdin.write_all(&prompt).await })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::Transport(format!("generator I/O failed: {e}")))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may exit without reading everything; its status decides.
                Ok(Err(e)) => tracing::debug!(error = %e, "generator closed stdin early"),
                Err(e) => tracing::debug!(error = %e, "stdin writer task failed"),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(exit_error(output.status.code(), stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(GenerationResponse {
            usage: TokenUsage {
                input_tokens: word_count(&request.prompt),
                output_tokens: word_count(&text),
            },
            text,
        })
    }
}

fn exit_error(code: Option<i32>, stderr: String) -> StageError {
    let message = if stderr.is_empty() {
        format!("generator exited with status {code:?}")
    } else {
        stderr
    };
    match code {
        Some(75) => StageError::Overloaded(message),
        Some(69) => StageError::Transport(message),
        Some(77) => StageError::Authentication(message),
        Some(78) => StageError::Configuration(message),
        _ => StageError::Other {
            message,
            hint: None,
        },
    }
}

/// Token usage is approximated by whitespace-separated words.
fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

/// Deterministic generator for trying pipelines without a model backend.
///
/// Emits a heading per required section (read from the request parameters)
/// followed by the prompt it was given.
#[derive(Debug, Clone, Default)]
pub struct OfflineGenerator;

impl TextGenerator for OfflineGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, StageError> {
        let stage = request
            .parameters
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or("output");

        let mut text = format!("# {stage}\n");
        let sections = request
            .parameters
            .get("required_sections")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for section in sections {
            text.push_str(&format!("\n## {section}\n\nPending.\n"));
        }
        text.push_str("\n## Prompt\n\n");
        text.push_str(&request.prompt);
        text.push('\n');

        Ok(GenerationResponse {
            usage: TokenUsage {
                input_tokens: word_count(&request.prompt),
                output_tokens: word_count(&text),
            },
            text,
        })
    }
}

/// The generator selected for this process.
#[derive(Debug, Clone)]
pub enum Generator {
    Command(CommandGenerator),
    Offline(OfflineGenerator),
}

impl Generator {
    /// `CADENCE_GENERATOR` if set, otherwise the offline generator.
    pub fn from_env() -> Self {
        match std::env::var(GENERATOR_ENV) {
            Ok(command) if !command.trim().is_empty() => {
                Generator::Command(CommandGenerator::new(command))
            }
            _ => Generator::Offline(OfflineGenerator),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Generator::Command(g) => format!("command `{}`", g.command),
            Generator::Offline(_) => "offline".to_string(),
        }
    }
}

impl TextGenerator for Generator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, StageError> {
        match self {
            Generator::Command(g) => g.generate(request).await,
            Generator::Offline(g) => g.generate(request).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage bindings
// ---------------------------------------------------------------------------

/// Prompt and output contract for one stage (or branch).
#[derive(Debug, Clone, Deserialize)]
pub struct StageBinding {
    pub prompt: String,
    #[serde(default)]
    pub required_sections: Vec<String>,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
    #[serde(default)]
    pub parameters: Value,
}

fn default_artifact_type() -> String {
    "markdown".to_string()
}

impl StageBinding {
    fn fallback(pipeline: &str, stage: &str) -> Self {
        Self {
            prompt: format!("Produce the '{stage}' output of the '{pipeline}' pipeline."),
            required_sections: Vec::new(),
            artifact_type: default_artifact_type(),
            parameters: Value::Null,
        }
    }

    fn into_stage(self, generator: Generator, step: &str) -> GenerativeStage<Generator> {
        let mut parameters = json!({
            "stage": step,
            "required_sections": self.required_sections,
        });
        if let (Value::Object(extra), Some(target)) = (self.parameters, parameters.as_object_mut()) {
            target.extend(extra);
        }
        GenerativeStage::new(generator, self.prompt)
            .with_required_sections(self.required_sections)
            .with_artifact_type(self.artifact_type)
            .with_parameters(parameters)
    }
}

/// Directory holding a pipeline's stage bindings.
pub fn prompts_dir(data_dir: &Path, pipeline: &str) -> PathBuf {
    data_dir.join("prompts").join(pipeline)
}

async fn read_binding(path: &Path) -> Result<Option<StageBinding>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let binding = toml::from_str(&content)
        .with_context(|| format!("Invalid stage binding {}", path.display()))?;
    Ok(Some(binding))
}

/// Build the stage registry for a pipeline. Stages without a binding file get
/// a generic prompt; branch files override the stage binding for that branch.
pub async fn build_registry(
    data_dir: &Path,
    pipeline: &PipelineDefinition,
    generator: &Generator,
) -> Result<StageRegistry> {
    let dir = prompts_dir(data_dir, &pipeline.name);
    let mut registry = StageRegistry::new();

    for spec in &pipeline.stages {
        let binding = read_binding(&dir.join(format!("{}.toml", spec.name)))
            .await?
            .unwrap_or_else(|| StageBinding::fallback(&pipeline.name, &spec.name));

        for branch in &spec.branches {
            let path = dir.join(&spec.name).join(format!("{branch}.toml"));
            if let Some(branch_binding) = read_binding(&path).await? {
                let step = branch_stage_name(&spec.name, branch);
                let stage = branch_binding.into_stage(generator.clone(), &step);
                registry.register(step, stage);
            }
        }

        let stage = binding.into_stage(generator.clone(), &spec.name);
        registry.register(spec.name.clone(), stage);
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::pipeline::StageSpec;
    use tempfile::TempDir;

    fn request(prompt: &str, parameters: Value) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            parameters,
        }
    }

    #[tokio::test]
    async fn offline_generator_emits_required_sections() {
        let response = OfflineGenerator
            .generate(&request(
                "write it",
                json!({ "stage": "draft", "required_sections": ["Summary", "Sources"] }),
            ))
            .await
            .unwrap();
        assert!(response.text.starts_with("# draft"));
        assert!(response.text.contains("## Summary"));
        assert!(response.text.contains("## Sources"));
        assert!(response.text.contains("write it"));
        assert_eq!(response.usage.input_tokens, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_pipes_prompt_through() {
        let generator = CommandGenerator::new("cat");
        let response = generator.generate(&request("hello there", Value::Null)).await.unwrap();
        assert_eq!(response.text, "hello there");
        assert_eq!(response.usage.output_tokens, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_exit_codes_are_classified() {
        let err = CommandGenerator::new("echo busy >&2; exit 75")
            .generate(&request("x", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, StageError::Overloaded("busy".to_string()));

        let err = CommandGenerator::new("exit 78")
            .generate(&request("x", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Configuration(_)));

        let err = CommandGenerator::new("exit 1")
            .generate(&request("x", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Other { hint: None, .. }));
    }

    #[tokio::test]
    async fn registry_uses_binding_files_and_fallbacks() {
        let tmp = TempDir::new().unwrap();
        let dir = prompts_dir(tmp.path(), "article");
        tokio::fs::create_dir_all(dir.join("analysis")).await.unwrap();
        tokio::fs::write(
            dir.join("research.toml"),
            "prompt = \"Research {{topic}}\"\nrequired_sections = [\"Sources\"]\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("analysis/market.toml"), "prompt = \"Size the market\"\n")
            .await
            .unwrap();

        let pipeline = PipelineDefinition {
            name: "article".to_string(),
            description: None,
            stages: vec![
                StageSpec::single("research"),
                StageSpec::parallel("analysis", &["market", "audience"]),
            ],
        };
        let registry = build_registry(tmp.path(), &pipeline, &Generator::Offline(OfflineGenerator))
            .await
            .unwrap();

        assert_eq!(registry.len(), 3);
        assert!(registry.contains("research"));
        assert!(registry.contains("analysis/market"));
        assert!(!registry.contains("analysis/audience"));
        assert!(registry.resolve("analysis", Some("audience")).is_some());
    }

    #[tokio::test]
    async fn demo_data_dir_is_valid() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let pipeline = cadence_core::pipeline::definition::load_pipeline_file(
            &demos.join("pipelines/article.yaml"),
        )
        .unwrap();
        let registry = build_registry(&demos, &pipeline, &Generator::Offline(OfflineGenerator))
            .await
            .unwrap();
        assert!(registry.contains("analysis/competitors"));
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn malformed_binding_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dir = prompts_dir(tmp.path(), "p");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("draft.toml"), "required_sections = 3").await.unwrap();

        let pipeline = PipelineDefinition {
            name: "p".to_string(),
            description: None,
            stages: vec![StageSpec::single("draft")],
        };
        let err = build_registry(tmp.path(), &pipeline, &Generator::Offline(OfflineGenerator))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid stage binding"));
    }
}
