//! Steps (one stage within one run) and their append-only attempt history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Digest;
use crate::failure::FailureClass;

/// Separator between a parallel stage and its branch in a step's stage name.
pub const BRANCH_SEPARATOR: char = '/';

/// Step name for one branch of a parallel stage (`analysis/market`).
pub fn branch_stage_name(stage: &str, branch: &str) -> String {
    format!("{stage}{BRANCH_SEPARATOR}{branch}")
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// A `(run, stage_name)` pair. Created lazily when the engine first schedules the stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Stage name, or `stage/branch` for a branch of a parallel stage.
    pub stage_name: String,
    pub status: StepStatus,
    /// Retries consumed so far (automatic and human-requested).
    pub retry_count: u32,
    /// Number of human-requested re-invocations; part of the input digest.
    pub revision: u32,
    /// Latest correction instruction supplied with a re-invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(run_id: Uuid, stage_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            run_id,
            stage_name: stage_name.into(),
            status: StepStatus::Pending,
            retry_count: 0,
            revision: 0,
            instruction: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    /// Left running by a crashed worker and reaped after its heartbeat went stale.
    Abandoned,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AttemptStatus::Running),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "abandoned" => Ok(AttemptStatus::Abandoned),
            other => Err(format!("invalid attempt status: '{other}'")),
        }
    }
}

/// One concrete invocation of a stage. Never mutated after it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub step_id: Uuid,
    /// 1-based attempt number within the step.
    pub attempt_num: u32,
    pub status: AttemptStatus,
    pub input_digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<Digest>,
    /// Artifact type of the output, kept so a lost artifact row can be rebuilt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Attempt {
    /// A fresh running attempt.
    pub fn begin(step_id: Uuid, attempt_num: u32, input_digest: Digest) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id,
            attempt_num,
            status: AttemptStatus::Running,
            input_digest,
            output_digest: None,
            output_type: None,
            started_at: Utc::now(),
            heartbeat_at: None,
            completed_at: None,
            duration_ms: None,
            metrics: serde_json::Value::Null,
            warnings: Vec::new(),
            classification: None,
            error: None,
        }
    }
}

/// Terminal result written onto an attempt exactly once.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded {
        output_digest: Digest,
        artifact_type: String,
        duration_ms: u64,
        metrics: serde_json::Value,
        warnings: Vec<String>,
    },
    Failed {
        classification: FailureClass,
        error: String,
        duration_ms: u64,
    },
    Abandoned {
        reason: String,
    },
}

impl AttemptOutcome {
    pub fn status(&self) -> AttemptStatus {
        match self {
            AttemptOutcome::Succeeded { .. } => AttemptStatus::Succeeded,
            AttemptOutcome::Failed { .. } => AttemptStatus::Failed,
            AttemptOutcome::Abandoned { .. } => AttemptStatus::Abandoned,
        }
    }
}
