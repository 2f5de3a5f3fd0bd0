//! Pipeline repository trait definition.
//!
//! Defines the metadata store for runs, steps, attempts, artifacts,
//! checkpoints, the signal inbox and gate decisions. The infrastructure layer
//! (cadence-infra) implements this trait with SQLite persistence;
//! `repository::memory` provides an in-process implementation.

use cadence_types::artifact::{Artifact, Digest};
use cadence_types::checkpoint::Checkpoint;
use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, RunStatus, RunUpdate, TenantId};
use cadence_types::signal::{GateDecision, SignalEnvelope, SignalRecord};
use cadence_types::step::{Attempt, AttemptOutcome, Step};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for pipeline persistence.
///
/// Uniqueness rules the implementation must enforce (these carry the engine's
/// concurrency guarantees, not in-memory locks):
/// - one step per `(run_id, stage_name)`
/// - one attempt per `(step_id, attempt_num)`, and at most one `running`
///   attempt per step
/// - one artifact per `(run_id, step_id, artifact_type)`
/// - one signal per `(run_id, delivery_id)`
/// - one gate decision per `(run_id, stage, iteration)`
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PipelineRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// Write the mutable portion of a run. Sets `updated_at`, and
    /// `completed_at` when the new status is terminal.
    fn update_run(
        &self,
        run_id: &Uuid,
        update: &RunUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs newest first, optionally filtered by tenant.
    fn list_runs(
        &self,
        tenant: Option<&TenantId>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    /// Runs in the given status (crash recovery looks for `running`).
    fn list_runs_by_status(
        &self,
        status: RunStatus,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    /// Delete a run and everything it owns. Returns `true` if it existed.
    fn delete_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert a step. A duplicate `(run_id, stage_name)` is `RepositoryError::Conflict`.
    fn create_step(
        &self,
        step: &Step,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step(
        &self,
        run_id: &Uuid,
        stage_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Step>, RepositoryError>> + Send;

    /// Steps of a run, ordered by creation.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Step>, RepositoryError>> + Send;

    /// Persist status, counters, instruction and error code of a step.
    fn update_step(
        &self,
        step: &Step,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Insert a running attempt. Fails with `RepositoryError::Conflict` if the
    /// step already has a running attempt or the attempt number is taken.
    fn insert_attempt(
        &self,
        attempt: &Attempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a running attempt to its terminal status. An attempt that is
    /// already terminal is never rewritten (`RepositoryError::Conflict`).
    fn finish_attempt(
        &self,
        attempt_id: &Uuid,
        outcome: &AttemptOutcome,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn record_heartbeat(
        &self,
        attempt_id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Attempts of a step ordered by `attempt_num`.
    fn list_attempts(
        &self,
        step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Attempt>, RepositoryError>> + Send;

    /// Succeeded attempts of a step that ran with the given input digest.
    fn find_succeeded_attempts(
        &self,
        step_id: &Uuid,
        input_digest: &Digest,
    ) -> impl std::future::Future<Output = Result<Vec<Attempt>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Upsert by `(run_id, step_id, artifact_type)`.
    fn save_artifact(
        &self,
        artifact: &Artifact,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Artifacts of a run, ordered by creation.
    fn list_artifacts(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Artifact>, RepositoryError>> + Send;

    /// Number of artifact rows and succeeded attempt outputs (across all runs)
    /// referencing a digest.
    fn count_digest_references(
        &self,
        digest: &Digest,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Upsert by `(run_id, stage_name, phase)`.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        run_id: &Uuid,
        stage_name: &str,
        phase: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Delete every phase checkpoint of a step. Returns the number removed.
    fn delete_checkpoints(
        &self,
        run_id: &Uuid,
        stage_name: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Signal inbox
    // -----------------------------------------------------------------------

    /// Append a signal to the run's inbox. Returns the assigned sequence
    /// number, or `None` if this delivery ID was already received.
    fn append_signal(
        &self,
        run_id: &Uuid,
        envelope: &SignalEnvelope,
    ) -> impl std::future::Future<Output = Result<Option<i64>, RepositoryError>> + Send;

    /// Unconsumed signals in arrival order.
    fn pending_signals(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<SignalRecord>, RepositoryError>> + Send;

    fn mark_signal_consumed(
        &self,
        run_id: &Uuid,
        seq: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Gate decisions
    // -----------------------------------------------------------------------

    /// Record the decision for one opening of a gate. Returns `false` when a
    /// decision already exists for `(run_id, stage, iteration)`; the stored
    /// decision is left unchanged (first writer wins).
    fn record_gate_decision(
        &self,
        run_id: &Uuid,
        stage: &str,
        iteration: u32,
        decision: &GateDecision,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_gate_decision(
        &self,
        run_id: &Uuid,
        stage: &str,
        iteration: u32,
    ) -> impl std::future::Future<Output = Result<Option<GateDecision>, RepositoryError>> + Send;
}
