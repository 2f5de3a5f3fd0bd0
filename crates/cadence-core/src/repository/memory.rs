//! In-memory `PipelineRepository`.
//!
//! Backs the engine in tests and single-process embedding. Every write happens
//! under one `RwLock` write guard, so the uniqueness rules of the trait are
//! checked and applied atomically, matching the constraint-based behaviour of
//! the SQLite implementation.

use std::collections::HashMap;

use cadence_types::artifact::{Artifact, Digest};
use cadence_types::checkpoint::Checkpoint;
use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, RunStatus, RunUpdate, TenantId};
use cadence_types::signal::{GateDecision, SignalEnvelope, SignalRecord};
use cadence_types::step::{Attempt, AttemptOutcome, AttemptStatus, Step};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::pipeline::PipelineRepository;

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    steps: Vec<Step>,
    attempts: Vec<Attempt>,
    artifacts: Vec<Artifact>,
    checkpoints: HashMap<(Uuid, String, String), Checkpoint>,
    signals: Vec<SignalRecord>,
    next_seq: i64,
    gate_decisions: HashMap<(Uuid, String, u32), GateDecision>,
}

/// Process-local implementation of [`PipelineRepository`].
#[derive(Default)]
pub struct InMemoryPipelineRepository {
    state: RwLock<State>,
}

impl InMemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Copy a terminal outcome onto an attempt record.
fn apply_outcome(attempt: &mut Attempt, outcome: &AttemptOutcome, now: DateTime<Utc>) {
    attempt.status = outcome.status();
    attempt.completed_at = Some(now);
    match outcome {
        AttemptOutcome::Succeeded {
            output_digest,
            artifact_type,
            duration_ms,
            metrics,
            warnings,
        } => {
            attempt.output_digest = Some(output_digest.clone());
            attempt.output_type = Some(artifact_type.clone());
            attempt.duration_ms = Some(*duration_ms);
            attempt.metrics = metrics.clone();
            attempt.warnings = warnings.clone();
        }
        AttemptOutcome::Failed {
            classification,
            error,
            duration_ms,
        } => {
            attempt.classification = Some(*classification);
            attempt.error = Some(error.clone());
            attempt.duration_ms = Some(*duration_ms);
        }
        AttemptOutcome::Abandoned { reason } => {
            attempt.error = Some(reason.clone());
        }
    }
}

impl PipelineRepository for InMemoryPipelineRepository {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn update_run(&self, run_id: &Uuid, update: &RunUpdate) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        run.status = update.status;
        run.current_stage = update.current_stage.clone();
        run.gate = update.gate.clone();
        run.error = update.error.clone();
        run.updated_at = now;
        if update.status.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        tenant: Option<&TenantId>,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| tenant.is_none_or(|t| &r.tenant == t))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        if state.runs.remove(run_id).is_none() {
            return Ok(false);
        }
        let step_ids: Vec<Uuid> = state
            .steps
            .iter()
            .filter(|s| &s.run_id == run_id)
            .map(|s| s.id)
            .collect();
        state.attempts.retain(|a| !step_ids.contains(&a.step_id));
        state.steps.retain(|s| &s.run_id != run_id);
        state.artifacts.retain(|a| &a.run_id != run_id);
        state.checkpoints.retain(|(r, _, _), _| r != run_id);
        state.signals.retain(|s| &s.run_id != run_id);
        state.gate_decisions.retain(|(r, _, _), _| r != run_id);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn create_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state
            .steps
            .iter()
            .any(|s| s.run_id == step.run_id && s.stage_name == step.stage_name)
        {
            return Err(RepositoryError::Conflict(format!(
                "step '{}' exists for run {}",
                step.stage_name, step.run_id
            )));
        }
        state.steps.push(step.clone());
        Ok(())
    }

    async fn get_step(&self, run_id: &Uuid, stage_name: &str) -> Result<Option<Step>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .iter()
            .find(|s| &s.run_id == run_id && s.stage_name == stage_name)
            .cloned())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .iter()
            .filter(|s| &s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn update_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let stored = state
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or(RepositoryError::NotFound)?;
        stored.status = step.status;
        stored.retry_count = step.retry_count;
        stored.revision = step.revision;
        stored.instruction = step.instruction.clone();
        stored.error_code = step.error_code.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.attempts.iter().any(|a| {
            a.step_id == attempt.step_id
                && (a.attempt_num == attempt.attempt_num || a.status == AttemptStatus::Running)
        }) {
            return Err(RepositoryError::Conflict(format!(
                "attempt {} of step {} conflicts with an existing attempt",
                attempt.attempt_num, attempt.step_id
            )));
        }
        state.attempts.push(attempt.clone());
        Ok(())
    }

    async fn finish_attempt(
        &self,
        attempt_id: &Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| &a.id == attempt_id)
            .ok_or(RepositoryError::NotFound)?;
        if attempt.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "attempt {attempt_id} is already {}",
                attempt.status
            )));
        }
        apply_outcome(attempt, outcome, Utc::now());
        Ok(())
    }

    async fn record_heartbeat(&self, attempt_id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(attempt) = state
            .attempts
            .iter_mut()
            .find(|a| &a.id == attempt_id && a.status == AttemptStatus::Running)
        {
            attempt.heartbeat_at = Some(at);
        }
        Ok(())
    }

    async fn list_attempts(&self, step_id: &Uuid) -> Result<Vec<Attempt>, RepositoryError> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .iter()
            .filter(|a| &a.step_id == step_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_num);
        Ok(attempts)
    }

    async fn find_succeeded_attempts(
        &self,
        step_id: &Uuid,
        input_digest: &Digest,
    ) -> Result<Vec<Attempt>, RepositoryError> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .iter()
            .filter(|a| {
                &a.step_id == step_id
                    && a.status == AttemptStatus::Succeeded
                    && &a.input_digest == input_digest
            })
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_num);
        Ok(attempts)
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    async fn save_artifact(&self, artifact: &Artifact) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.artifacts.retain(|a| {
            !(a.run_id == artifact.run_id
                && a.step_id == artifact.step_id
                && a.artifact_type == artifact.artifact_type)
        });
        state.artifacts.push(artifact.clone());
        Ok(())
    }

    async fn list_artifacts(&self, run_id: &Uuid) -> Result<Vec<Artifact>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .artifacts
            .iter()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn count_digest_references(&self, digest: &Digest) -> Result<u64, RepositoryError> {
        let state = self.state.read().await;
        let artifacts = state.artifacts.iter().filter(|a| &a.digest == digest).count();
        let outputs = state
            .attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Succeeded && a.output_digest.as_ref() == Some(digest))
            .count();
        Ok((artifacts + outputs) as u64)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let key = (
            checkpoint.run_id,
            checkpoint.stage_name.clone(),
            checkpoint.phase.clone(),
        );
        self.state.write().await.checkpoints.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        run_id: &Uuid,
        stage_name: &str,
        phase: &str,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let key = (*run_id, stage_name.to_string(), phase.to_string());
        Ok(self.state.read().await.checkpoints.get(&key).cloned())
    }

    async fn delete_checkpoints(&self, run_id: &Uuid, stage_name: &str) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let before = state.checkpoints.len();
        state
            .checkpoints
            .retain(|(r, s, _), _| !(r == run_id && s == stage_name));
        Ok((before - state.checkpoints.len()) as u64)
    }

    // -----------------------------------------------------------------------
    // Signal inbox
    // -----------------------------------------------------------------------

    async fn append_signal(
        &self,
        run_id: &Uuid,
        envelope: &SignalEnvelope,
    ) -> Result<Option<i64>, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(run_id) {
            return Err(RepositoryError::NotFound);
        }
        if state
            .signals
            .iter()
            .any(|s| &s.run_id == run_id && s.delivery_id == envelope.delivery_id)
        {
            return Ok(None);
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.signals.push(SignalRecord {
            run_id: *run_id,
            seq,
            delivery_id: envelope.delivery_id,
            signal: envelope.signal.clone(),
            received_at: Utc::now(),
            consumed_at: None,
        });
        Ok(Some(seq))
    }

    async fn pending_signals(&self, run_id: &Uuid) -> Result<Vec<SignalRecord>, RepositoryError> {
        let state = self.state.read().await;
        let mut pending: Vec<SignalRecord> = state
            .signals
            .iter()
            .filter(|s| &s.run_id == run_id && s.consumed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.seq);
        Ok(pending)
    }

    async fn mark_signal_consumed(&self, run_id: &Uuid, seq: i64) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let record = state
            .signals
            .iter_mut()
            .find(|s| &s.run_id == run_id && s.seq == seq)
            .ok_or(RepositoryError::NotFound)?;
        record.consumed_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Gate decisions
    // -----------------------------------------------------------------------

    async fn record_gate_decision(
        &self,
        run_id: &Uuid,
        stage: &str,
        iteration: u32,
        decision: &GateDecision,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let key = (*run_id, stage.to_string(), iteration);
        if state.gate_decisions.contains_key(&key) {
            return Ok(false);
        }
        state.gate_decisions.insert(key, decision.clone());
        Ok(true)
    }

    async fn get_gate_decision(
        &self,
        run_id: &Uuid,
        stage: &str,
        iteration: u32,
    ) -> Result<Option<GateDecision>, RepositoryError> {
        let key = (*run_id, stage.to_string(), iteration);
        Ok(self.state.read().await.gate_decisions.get(&key).cloned())
    }
}
