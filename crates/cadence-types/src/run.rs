//! Run: one end-to-end execution of a pipeline for one input.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::FailureClass;

/// Tenant scope for a run and everything it owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a run.
///
/// `pending -> running -> {waiting_approval, waiting_review, paused} -> running
/// -> {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    WaitingReview,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Suspension points: the only states in which signals are consumed.
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            RunStatus::WaitingApproval | RunStatus::WaitingReview | RunStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::WaitingReview => "waiting_review",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "waiting_approval" => Ok(RunStatus::WaitingApproval),
            "waiting_review" => Ok(RunStatus::WaitingReview),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Kind of human gate attached to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Final accept/reject decision.
    Approval,
    /// Per-stage review: accept some outputs, send others back with instructions.
    Review,
}

impl GateKind {
    /// The run status a gate of this kind suspends into.
    pub fn waiting_status(self) -> RunStatus {
        match self {
            GateKind::Approval => RunStatus::WaitingApproval,
            GateKind::Review => RunStatus::WaitingReview,
        }
    }
}

/// The gate a run is currently suspended at.
///
/// `iteration` counts how many times this stage's gate has opened in the run;
/// decisions are recorded per `(run, stage, iteration)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGate {
    pub stage: String,
    pub kind: GateKind,
    pub iteration: u32,
}

/// Terminal failure detail attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Stage that caused the failure (None for run-level failures).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Stable machine-readable code (e.g. "rate_limited", "rejected").
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    /// Number of attempts made on the failing step.
    pub attempts: u32,
    pub message: String,
}

/// One end-to-end execution of the staged pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run ID.
    pub id: Uuid,
    pub tenant: TenantId,
    /// Name of the pipeline definition being executed.
    pub pipeline: String,
    pub status: RunStatus,
    /// Stage the engine is at (None before the first stage is scheduled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Immutable run configuration handed to every stage.
    pub config: serde_json::Value,
    /// Run this one was resumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    /// Stage execution restarted at when this run was created by `resume_from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<OpenGate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl Run {
    /// Create a new pending run.
    pub fn new(tenant: TenantId, pipeline: impl Into<String>, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant,
            pipeline: pipeline.into(),
            status: RunStatus::Pending,
            current_stage: None,
            config,
            parent_run_id: None,
            resumed_from: None,
            gate: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }
}

/// Mutable portion of a run, written as one unit by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub gate: Option<OpenGate>,
    pub error: Option<RunError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::WaitingApproval,
            RunStatus::WaitingReview,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_and_suspended_are_disjoint() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Paused.is_suspended());
        assert!(RunStatus::WaitingReview.is_suspended());
        assert!(!RunStatus::Running.is_suspended());
        assert!(!RunStatus::Failed.is_suspended());
    }

    #[test]
    fn run_status_serde_matches_as_str() {
        let json = serde_json::to_value(RunStatus::WaitingApproval).unwrap();
        assert_eq!(json, serde_json::json!("waiting_approval"));
    }

    #[test]
    fn gate_kind_maps_to_waiting_status() {
        assert_eq!(GateKind::Approval.waiting_status(), RunStatus::WaitingApproval);
        assert_eq!(GateKind::Review.waiting_status(), RunStatus::WaitingReview);
    }

    #[test]
    fn new_run_is_pending_without_stage() {
        let run = Run::new(TenantId::new("acme"), "article", serde_json::json!({"topic": "x"}));
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.current_stage.is_none());
        assert!(run.error.is_none());
        assert_eq!(run.tenant.to_string(), "acme");
    }
}
