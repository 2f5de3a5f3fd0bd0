//! External signal surface of a run.
//!
//! Signals form a closed tagged union: every variant carries a strongly typed
//! payload and the state machine resolves them by exhaustive matching.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review verdict for one stage (or `stage/branch`) at a review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReview {
    pub stage: String,
    pub accepted: bool,
    #[serde(default)]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

/// A signal delivered to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Approve,
    Reject {
        reason: String,
    },
    /// Reject and send the named stages back with correction text.
    RejectWithInstructions {
        per_stage: BTreeMap<String, String>,
    },
    StageReview {
        reviews: Vec<StageReview>,
    },
    RetryStage {
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
    /// Start a new run that reuses every artifact produced before `stage`.
    ResumeFrom {
        stage: String,
    },
    Pause,
    Continue,
    Cancel,
}

impl Signal {
    /// Short name for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Approve => "approve",
            Signal::Reject { .. } => "reject",
            Signal::RejectWithInstructions { .. } => "reject_with_instructions",
            Signal::StageReview { .. } => "stage_review",
            Signal::RetryStage { .. } => "retry_stage",
            Signal::ResumeFrom { .. } => "resume_from",
            Signal::Pause => "pause",
            Signal::Continue => "continue",
            Signal::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A signal plus the sender-chosen delivery ID used to drop duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub delivery_id: Uuid,
    pub signal: Signal,
}

impl SignalEnvelope {
    /// Wrap a signal with a fresh delivery ID.
    pub fn new(signal: Signal) -> Self {
        Self {
            delivery_id: Uuid::now_v7(),
            signal,
        }
    }
}

/// A signal as stored in a run's durable inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub run_id: Uuid,
    /// Arrival order within the run (assigned by the store).
    pub seq: i64,
    pub delivery_id: Uuid,
    pub signal: Signal,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Decision recorded against one opening of a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateDecision {
    Approved,
    Rejected { reason: String },
    /// Sent back for rework; the gate reopens with the next iteration.
    Reworked { targets: Vec<ReworkTarget> },
}

/// One step sent back from a gate, with the correction text for its next revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkTarget {
    /// Step name (`stage` or `stage/branch`).
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl GateDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            GateDecision::Approved => "approved",
            GateDecision::Rejected { .. } => "rejected",
            GateDecision::Reworked { .. } => "reworked",
        }
    }
}
