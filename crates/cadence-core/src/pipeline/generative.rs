//! Adapter turning a text generator into a pipeline stage.
//!
//! The generator itself is an external collaborator (any LLM backend). This
//! module owns the prompt assembly and the structural output contract: a
//! generated document must contain every required markdown section, or the
//! attempt fails with a validation error listing what is missing.

use std::future::Future;

use cadence_types::failure::StageError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::stage::{Stage, StageContext, StageInput, StageOutput};

// ---------------------------------------------------------------------------
// Generator port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// A text generation backend.
///
/// Implementations report failures as typed `StageError`s (rate limits,
/// timeouts, auth) so the engine can classify them.
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<GenerationResponse, StageError>> + Send;
}

// ---------------------------------------------------------------------------
// GenerativeStage
// ---------------------------------------------------------------------------

/// Stage that renders a prompt, calls a generator and validates the document.
pub struct GenerativeStage<G: TextGenerator> {
    generator: G,
    prompt_template: String,
    required_sections: Vec<String>,
    artifact_type: String,
    parameters: Value,
}

impl<G: TextGenerator> GenerativeStage<G> {
    pub fn new(generator: G, prompt_template: impl Into<String>) -> Self {
        Self {
            generator,
            prompt_template: prompt_template.into(),
            required_sections: Vec::new(),
            artifact_type: "markdown".to_string(),
            parameters: Value::Null,
        }
    }

    /// Markdown headings (without `#`) the output must contain.
    pub fn with_required_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_sections = sections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = artifact_type.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Assemble the full prompt: rendered template, upstream outputs, then
    /// correction instructions.
    pub fn build_prompt(&self, input: &StageInput) -> String {
        let mut prompt = render_template(&self.prompt_template, &input.config);

        if let Some(branch) = &input.branch {
            prompt.push_str(&format!("\n\nFocus: {branch}"));
        }

        for prior in &input.prior {
            prompt.push_str(&format!(
                "\n\n--- Output of {} ---\n{}",
                prior.artifact.stage_name,
                prior.text()
            ));
        }

        if !input.instructions.is_empty() {
            prompt.push_str("\n\n--- Corrections ---");
            for instruction in &input.instructions {
                prompt.push_str("\n- ");
                prompt.push_str(instruction);
            }
        }

        if !self.required_sections.is_empty() {
            prompt.push_str("\n\nThe response must contain these sections: ");
            prompt.push_str(&self.required_sections.join(", "));
        }
        prompt
    }
}

impl<G: TextGenerator> Stage for GenerativeStage<G> {
    async fn run(&self, input: &StageInput, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        let request = GenerationRequest {
            prompt: self.build_prompt(input),
            parameters: self.parameters.clone(),
        };
        let response = self.generator.generate(&request).await?;

        if response.text.trim().is_empty() {
            return Err(StageError::Validation {
                missing: vec!["content".to_string()],
                message: "generator returned empty output".to_string(),
            });
        }

        let missing = missing_sections(&response.text, &self.required_sections);
        if !missing.is_empty() {
            tracing::debug!(
                run_id = %input.run_id,
                stage = %input.step_name(),
                missing = ?missing,
                "generated output missing required sections"
            );
            return Err(StageError::validation(missing));
        }

        Ok(StageOutput::new(self.artifact_type.clone(), response.text.into_bytes())
            .with_metrics(json!({
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            }))
            .with_metadata(json!({ "attempt": input.attempt })))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Replace `{{key}}` placeholders with top-level string/number values from `config`.
/// Unknown placeholders are left as-is.
pub fn render_template(template: &str, config: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match config.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(v) if !v.is_null() => out.push_str(&v.to_string()),
                    _ => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Required sections with no matching markdown heading (case-insensitive).
pub fn missing_sections(text: &str, required: &[String]) -> Vec<String> {
    let headings: Vec<String> = text
        .lines()
        .map(str::trim_start)
        .filter(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_lowercase())
        .collect();

    required
        .iter()
        .filter(|section| !headings.iter().any(|h| h == &section.trim().to_lowercase()))
        .cloned()
        .collect()
}
