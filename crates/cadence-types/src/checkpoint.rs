//! Intra-step phase snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Digest;

/// Durable snapshot of one named phase of a multi-call stage.
///
/// Only valid for the `input_digest` that produced it; a reader presenting a
/// different digest must recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub stage_name: String,
    pub phase: String,
    pub data: serde_json::Value,
    pub input_digest: Digest,
    pub saved_at: DateTime<Utc>,
}
