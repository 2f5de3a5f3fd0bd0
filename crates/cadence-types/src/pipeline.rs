//! Pipeline definition: the ordered stages a run advances through.
//!
//! Loaded from YAML:
//! ```yaml
//! name: article
//! stages:
//!   - name: research
//!     timeout_secs: 600
//!   - name: analysis
//!     branches: [market, audience, competitors]
//!     gate: review
//!   - name: draft
//!     gate: approval
//! ```

use serde::{Deserialize, Serialize};

use crate::run::GateKind;
use crate::step::branch_stage_name;

/// The ordered list of stages making up a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}

/// One stage of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique within the pipeline.
    pub name: String,
    /// Named branches for a parallel stage; empty for a single-call stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    /// Human gate opened after the stage completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateKind>,
    /// Overrides the engine's timeout lookup table for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Overrides the engine's default retry cap for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StageSpec {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            gate: None,
            timeout_secs: None,
            max_retries: None,
        }
    }

    pub fn parallel(name: impl Into<String>, branches: &[&str]) -> Self {
        Self {
            branches: branches.iter().map(|b| b.to_string()).collect(),
            ..Self::single(name)
        }
    }

    pub fn with_gate(mut self, gate: GateKind) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn is_parallel(&self) -> bool {
        !self.branches.is_empty()
    }

    /// Step names this stage produces: its own name, or one per branch.
    pub fn step_names(&self) -> Vec<String> {
        if self.is_parallel() {
            self.branches
                .iter()
                .map(|b| branch_stage_name(&self.name, b))
                .collect()
        } else {
            vec![self.name.clone()]
        }
    }
}
