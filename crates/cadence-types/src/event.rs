//! Lifecycle events for the pipeline event bus.
//!
//! `PipelineEvent` is broadcast by the executor and state machine. All variants
//! are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Digest;
use crate::failure::FailureClass;
use crate::run::RunStatus;

/// Events emitted while runs advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: Uuid,
        pipeline: String,
    },

    StageStarted {
        run_id: Uuid,
        stage: String,
        attempt_num: u32,
    },

    StageCompleted {
        run_id: Uuid,
        stage: String,
        digest: Digest,
        duration_ms: u64,
    },

    /// A step was satisfied by an earlier successful attempt with the same input digest.
    StageCacheHit {
        run_id: Uuid,
        stage: String,
        digest: Digest,
    },

    StageFailed {
        run_id: Uuid,
        stage: String,
        classification: FailureClass,
        error: String,
        will_retry: bool,
    },

    /// Liveness signal from a long-running attempt.
    Heartbeat {
        run_id: Uuid,
        stage: String,
        attempt_id: Uuid,
    },

    /// The run reached a suspension point (gate or pause).
    RunSuspended {
        run_id: Uuid,
        status: RunStatus,
        stage: Option<String>,
    },

    RunCompleted {
        run_id: Uuid,
        duration_ms: u64,
    },

    RunFailed {
        run_id: Uuid,
        code: String,
        error: String,
    },

    RunCancelled {
        run_id: Uuid,
    },

    /// A signal was consumed without effect because it did not apply in the current state.
    SignalIgnored {
        run_id: Uuid,
        signal: String,
        status: RunStatus,
    },

    /// A new run was created from an existing one by `resume_from`.
    RunForked {
        parent_run_id: Uuid,
        run_id: Uuid,
        from_stage: String,
    },
}

impl PipelineEvent {
    /// The run the event belongs to (the new run for `RunForked`).
    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::StageStarted { run_id, .. }
            | PipelineEvent::StageCompleted { run_id, .. }
            | PipelineEvent::StageCacheHit { run_id, .. }
            | PipelineEvent::StageFailed { run_id, .. }
            | PipelineEvent::Heartbeat { run_id, .. }
            | PipelineEvent::RunSuspended { run_id, .. }
            | PipelineEvent::RunCompleted { run_id, .. }
            | PipelineEvent::RunFailed { run_id, .. }
            | PipelineEvent::RunCancelled { run_id }
            | PipelineEvent::SignalIgnored { run_id, .. }
            | PipelineEvent::RunForked { run_id, .. } => *run_id,
        }
    }
}
