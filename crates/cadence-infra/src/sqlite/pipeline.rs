//! SQLite pipeline repository implementation.
//!
//! Implements `PipelineRepository` from `cadence-core` using sqlx with split
//! read/write pools. The uniqueness rules of the trait are table constraints:
//! `UNIQUE(run_id, stage_name)` on steps, a partial unique index allowing one
//! running attempt per step, `UNIQUE(run_id, delivery_id)` on the signal inbox
//! and a primary key on `(run_id, stage, iteration)` for gate decisions.
//!
//! Timestamps are stored as RFC 3339 text with fixed microsecond precision so
//! that lexical order matches chronological order.

use cadence_core::repository::pipeline::PipelineRepository;
use cadence_types::artifact::{Artifact, Digest};
use cadence_types::checkpoint::Checkpoint;
use cadence_types::error::RepositoryError;
use cadence_types::run::{OpenGate, Run, RunError, RunStatus, RunUpdate, TenantId};
use cadence_types::signal::{GateDecision, Signal, SignalEnvelope, SignalRecord};
use cadence_types::step::{Attempt, AttemptOutcome, AttemptStatus, Step, StepStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `PipelineRepository`.
#[derive(Clone)]
pub struct SqlitePipelineRepository {
    pool: DatabasePool,
}

impl SqlitePipelineRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    tenant: String,
    pipeline: String,
    status: String,
    current_stage: Option<String>,
    config: String,
    parent_run_id: Option<String>,
    resumed_from: Option<String>,
    gate: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant: row.try_get("tenant")?,
            pipeline: row.try_get("pipeline")?,
            status: row.try_get("status")?,
            current_stage: row.try_get("current_stage")?,
            config: row.try_get("config")?,
            parent_run_id: row.try_get("parent_run_id")?,
            resumed_from: row.try_get("resumed_from")?,
            gate: row.try_get("gate")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let gate: Option<OpenGate> = self.gate.as_deref().map(|s| parse_json(s, "gate")).transpose()?;
        let error: Option<RunError> = self
            .error
            .as_deref()
            .map(|s| parse_json(s, "run error"))
            .transpose()?;

        Ok(Run {
            id: parse_uuid(&self.id)?,
            tenant: TenantId::new(self.tenant),
            pipeline: self.pipeline,
            status,
            current_stage: self.current_stage,
            config: parse_json(&self.config, "run config")?,
            parent_run_id: self.parent_run_id.as_deref().map(parse_uuid).transpose()?,
            resumed_from: self.resumed_from,
            gate,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    stage_name: String,
    status: String,
    retry_count: i64,
    revision: i64,
    instruction: Option<String>,
    error_code: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            stage_name: row.try_get("stage_name")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            revision: row.try_get("revision")?,
            instruction: row.try_get("instruction")?,
            error_code: row.try_get("error_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<Step, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(Step {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            stage_name: self.stage_name,
            status,
            retry_count: self.retry_count as u32,
            revision: self.revision as u32,
            instruction: self.instruction,
            error_code: self.error_code,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct AttemptRow {
    id: String,
    step_id: String,
    attempt_num: i64,
    status: String,
    input_digest: String,
    output_digest: Option<String>,
    output_type: Option<String>,
    started_at: String,
    heartbeat_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    metrics: String,
    warnings: String,
    classification: Option<String>,
    error: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_id: row.try_get("step_id")?,
            attempt_num: row.try_get("attempt_num")?,
            status: row.try_get("status")?,
            input_digest: row.try_get("input_digest")?,
            output_digest: row.try_get("output_digest")?,
            output_type: row.try_get("output_type")?,
            started_at: row.try_get("started_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            metrics: row.try_get("metrics")?,
            warnings: row.try_get("warnings")?,
            classification: row.try_get("classification")?,
            error: row.try_get("error")?,
        })
    }

    fn into_attempt(self) -> Result<Attempt, RepositoryError> {
        let status: AttemptStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let classification = self
            .classification
            .as_deref()
            .map(|s| s.parse().map_err(RepositoryError::Query))
            .transpose()?;

        Ok(Attempt {
            id: parse_uuid(&self.id)?,
            step_id: parse_uuid(&self.step_id)?,
            attempt_num: self.attempt_num as u32,
            status,
            input_digest: parse_digest(&self.input_digest)?,
            output_digest: self.output_digest.as_deref().map(parse_digest).transpose()?,
            output_type: self.output_type,
            started_at: parse_datetime(&self.started_at)?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: self.duration_ms.map(|d| d as u64),
            metrics: parse_json(&self.metrics, "attempt metrics")?,
            warnings: parse_json(&self.warnings, "attempt warnings")?,
            classification,
            error: self.error,
        })
    }
}

struct ArtifactRow {
    id: String,
    run_id: String,
    step_id: String,
    stage_name: String,
    artifact_type: String,
    ref_path: String,
    digest: String,
    size_bytes: i64,
    metadata: String,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            stage_name: row.try_get("stage_name")?,
            artifact_type: row.try_get("artifact_type")?,
            ref_path: row.try_get("ref_path")?,
            digest: row.try_get("digest")?,
            size_bytes: row.try_get("size_bytes")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_artifact(self) -> Result<Artifact, RepositoryError> {
        Ok(Artifact {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_id: parse_uuid(&self.step_id)?,
            stage_name: self.stage_name,
            artifact_type: self.artifact_type,
            ref_path: self.ref_path,
            digest: parse_digest(&self.digest)?,
            size_bytes: self.size_bytes as u64,
            metadata: parse_json(&self.metadata, "artifact metadata")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct CheckpointRow {
    run_id: String,
    stage_name: String,
    phase: String,
    data: String,
    input_digest: String,
    saved_at: String,
}

impl CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            stage_name: row.try_get("stage_name")?,
            phase: row.try_get("phase")?,
            data: row.try_get("data")?,
            input_digest: row.try_get("input_digest")?,
            saved_at: row.try_get("saved_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            run_id: parse_uuid(&self.run_id)?,
            stage_name: self.stage_name,
            phase: self.phase,
            data: parse_json(&self.data, "checkpoint data")?,
            input_digest: parse_digest(&self.input_digest)?,
            saved_at: parse_datetime(&self.saved_at)?,
        })
    }
}

struct SignalRow {
    seq: i64,
    run_id: String,
    delivery_id: String,
    signal: String,
    received_at: String,
    consumed_at: Option<String>,
}

impl SignalRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            seq: row.try_get("seq")?,
            run_id: row.try_get("run_id")?,
            delivery_id: row.try_get("delivery_id")?,
            signal: row.try_get("signal")?,
            received_at: row.try_get("received_at")?,
            consumed_at: row.try_get("consumed_at")?,
        })
    }

    fn into_record(self) -> Result<SignalRecord, RepositoryError> {
        let signal: Signal = parse_json(&self.signal, "signal")?;
        Ok(SignalRecord {
            run_id: parse_uuid(&self.run_id)?,
            seq: self.seq,
            delivery_id: parse_uuid(&self.delivery_id)?,
            signal,
            received_at: parse_datetime(&self.received_at)?,
            consumed_at: self.consumed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_digest(s: &str) -> Result<Digest, RepositoryError> {
    s.parse::<Digest>()
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn read_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map constraint violations onto the trait's error contract.
fn write_err(e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return RepositoryError::Conflict(db.message().to_string());
        }
        if db.is_foreign_key_violation() {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::Query(e.to_string())
}

fn collect<T>(
    rows: &[SqliteRow],
    convert: impl Fn(&SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(convert).collect()
}

fn run_from(row: &SqliteRow) -> Result<Run, RepositoryError> {
    RunRow::from_row(row).map_err(read_err)?.into_run()
}

fn step_from(row: &SqliteRow) -> Result<Step, RepositoryError> {
    StepRow::from_row(row).map_err(read_err)?.into_step()
}

fn attempt_from(row: &SqliteRow) -> Result<Attempt, RepositoryError> {
    AttemptRow::from_row(row).map_err(read_err)?.into_attempt()
}

fn artifact_from(row: &SqliteRow) -> Result<Artifact, RepositoryError> {
    ArtifactRow::from_row(row).map_err(read_err)?.into_artifact()
}

// ---------------------------------------------------------------------------
// PipelineRepository impl
// ---------------------------------------------------------------------------

impl PipelineRepository for SqlitePipelineRepository {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let gate = run.gate.as_ref().map(to_json).transpose()?;
        let error = run.error.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, tenant, pipeline, status, current_stage, config, parent_run_id,
                resumed_from, gate, error, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.tenant.as_str())
        .bind(&run.pipeline)
        .bind(run.status.as_str())
        .bind(&run.current_stage)
        .bind(to_json(&run.config)?)
        .bind(run.parent_run_id.map(|id| id.to_string()))
        .bind(&run.resumed_from)
        .bind(&gate)
        .bind(&error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(read_err)?;

        row.as_ref().map(run_from).transpose()
    }

    async fn update_run(&self, run_id: &Uuid, update: &RunUpdate) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let completed_at = update.status.is_terminal().then(|| now.clone());
        let gate = update.gate.as_ref().map(to_json).transpose()?;
        let error = update.error.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE runs SET status = ?, current_stage = ?, gate = ?, error = ?,
                 updated_at = ?, completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(update.status.as_str())
        .bind(&update.current_stage)
        .bind(&gate)
        .bind(&error)
        .bind(&now)
        .bind(&completed_at)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_runs(&self, tenant: Option<&TenantId>, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let rows = match tenant {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE tenant = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(t.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(read_err)?;

        collect(&rows, run_from)
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM runs WHERE status = ? ORDER BY id ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(read_err)?;

        collect(&rows, run_from)
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        // Steps, attempts, artifacts, checkpoints, signals and gate decisions cascade.
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(write_err)?;

        Ok(result.rows_affected() > 0)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn create_step(&self, step: &Step) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO steps
               (id, run_id, stage_name, status, retry_count, revision, instruction,
                error_code, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(&step.stage_name)
        .bind(step.status.as_str())
        .bind(step.retry_count as i64)
        .bind(step.revision as i64)
        .bind(&step.instruction)
        .bind(&step.error_code)
        .bind(format_datetime(&step.created_at))
        .bind(format_datetime(&step.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(())
    }

    async fn get_step(&self, run_id: &Uuid, stage_name: &str) -> Result<Option<Step>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND stage_name = ?")
            .bind(run_id.to_string())
            .bind(stage_name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(read_err)?;

        row.as_ref().map(step_from).transpose()
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY created_at ASC, id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(read_err)?;

        collect(&rows, step_from)
    }

    async fn update_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE steps SET status = ?, retry_count = ?, revision = ?, instruction = ?,
                 error_code = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(step.status.as_str())
        .bind(step.retry_count as i64)
        .bind(step.revision as i64)
        .bind(&step.instruction)
        .bind(&step.error_code)
        .bind(format_datetime(&Utc::now()))
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO attempts
               (id, step_id, attempt_num, status, input_digest, output_digest, output_type,
                started_at, heartbeat_at, completed_at, duration_ms, metrics, warnings,
                classification, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.step_id.to_string())
        .bind(attempt.attempt_num as i64)
        .bind(attempt.status.as_str())
        .bind(attempt.input_digest.as_str())
        .bind(attempt.output_digest.as_ref().map(|d| d.as_str().to_string()))
        .bind(&attempt.output_type)
        .bind(format_datetime(&attempt.started_at))
        .bind(attempt.heartbeat_at.as_ref().map(format_datetime))
        .bind(attempt.completed_at.as_ref().map(format_datetime))
        .bind(attempt.duration_ms.map(|d| d as i64))
        .bind(to_json(&attempt.metrics)?)
        .bind(to_json(&attempt.warnings)?)
        .bind(attempt.classification.map(|c| c.as_str()))
        .bind(&attempt.error)
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(())
    }

    async fn finish_attempt(&self, attempt_id: &Uuid, outcome: &AttemptOutcome) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let status = outcome.status().as_str();

        let query = match outcome {
            AttemptOutcome::Succeeded {
                output_digest,
                artifact_type,
                duration_ms,
                metrics,
                warnings,
            } => sqlx::query(
                r#"UPDATE attempts SET status = ?, completed_at = ?, output_digest = ?,
                     output_type = ?, duration_ms = ?, metrics = ?, warnings = ?
                   WHERE id = ? AND status = 'running'"#,
            )
            .bind(status)
            .bind(&now)
            .bind(output_digest.as_str().to_string())
            .bind(artifact_type.clone())
            .bind(*duration_ms as i64)
            .bind(to_json(metrics)?)
            .bind(to_json(warnings)?),
            AttemptOutcome::Failed {
                classification,
                error,
                duration_ms,
            } => sqlx::query(
                r#"UPDATE attempts SET status = ?, completed_at = ?, classification = ?,
                     error = ?, duration_ms = ?
                   WHERE id = ? AND status = 'running'"#,
            )
            .bind(status)
            .bind(&now)
            .bind(classification.as_str())
            .bind(error.clone())
            .bind(*duration_ms as i64),
            AttemptOutcome::Abandoned { reason } => sqlx::query(
                r#"UPDATE attempts SET status = ?, completed_at = ?, error = ?
                   WHERE id = ? AND status = 'running'"#,
            )
            .bind(status)
            .bind(&now)
            .bind(reason.clone()),
        };

        let result = query
            .bind(attempt_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(write_err)?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing updated: either the attempt does not exist or it is already terminal.
        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM attempts WHERE id = ?")
            .bind(attempt_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(read_err)?;
        match current {
            Some((status,)) => Err(RepositoryError::Conflict(format!(
                "attempt {attempt_id} is already {status}"
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn record_heartbeat(&self, attempt_id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE attempts SET heartbeat_at = ? WHERE id = ? AND status = 'running'")
            .bind(format_datetime(&at))
            .bind(attempt_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn list_attempts(&self, step_id: &Uuid) -> Result<Vec<Attempt>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE step_id = ? ORDER BY attempt_num ASC")
            .bind(step_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(read_err)?;

        collect(&rows, attempt_from)
    }

    async fn find_succeeded_attempts(
        &self,
        step_id: &Uuid,
        input_digest: &Digest,
    ) -> Result<Vec<Attempt>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM attempts
               WHERE step_id = ? AND input_digest = ? AND status = 'succeeded'
               ORDER BY attempt_num ASC"#,
        )
        .bind(step_id.to_string())
        .bind(input_digest.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        collect(&rows, attempt_from)
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    async fn save_artifact(&self, artifact: &Artifact) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO artifacts
               (id, run_id, step_id, stage_name, artifact_type, ref_path, digest,
                size_bytes, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_id, artifact_type) DO UPDATE SET
                 id = excluded.id,
                 stage_name = excluded.stage_name,
                 ref_path = excluded.ref_path,
                 digest = excluded.digest,
                 size_bytes = excluded.size_bytes,
                 metadata = excluded.metadata,
                 created_at = excluded.created_at"#,
        )
        .bind(artifact.id.to_string())
        .bind(artifact.run_id.to_string())
        .bind(artifact.step_id.to_string())
        .bind(&artifact.stage_name)
        .bind(&artifact.artifact_type)
        .bind(&artifact.ref_path)
        .bind(artifact.digest.as_str())
        .bind(artifact.size_bytes as i64)
        .bind(to_json(&artifact.metadata)?)
        .bind(format_datetime(&artifact.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(())
    }

    async fn list_artifacts(&self, run_id: &Uuid) -> Result<Vec<Artifact>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE run_id = ? ORDER BY created_at ASC, id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(read_err)?;

        collect(&rows, artifact_from)
    }

    async fn count_digest_references(&self, digest: &Digest) -> Result<u64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT (SELECT COUNT(*) FROM artifacts WHERE digest = ?1)
                    + (SELECT COUNT(*) FROM attempts
                       WHERE output_digest = ?1 AND status = 'succeeded')"#,
        )
        .bind(digest.as_str())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(read_err)?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO checkpoints (run_id, stage_name, phase, data, input_digest, saved_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, stage_name, phase) DO UPDATE SET
                 data = excluded.data,
                 input_digest = excluded.input_digest,
                 saved_at = excluded.saved_at"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.stage_name)
        .bind(&checkpoint.phase)
        .bind(to_json(&checkpoint.data)?)
        .bind(checkpoint.input_digest.as_str())
        .bind(format_datetime(&checkpoint.saved_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(())
    }

    async fn get_checkpoint(
        &self,
        run_id: &Uuid,
        stage_name: &str,
        phase: &str,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE run_id = ? AND stage_name = ? AND phase = ?",
        )
        .bind(run_id.to_string())
        .bind(stage_name)
        .bind(phase)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(read_err)?;

        match row {
            Some(row) => Ok(Some(
                CheckpointRow::from_row(&row)
                    .map_err(read_err)?
                    .into_checkpoint()?,
            )),
            None => Ok(None),
        }
    }

    async fn delete_checkpoints(&self, run_id: &Uuid, stage_name: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ? AND stage_name = ?")
            .bind(run_id.to_string())
            .bind(stage_name)
            .execute(&self.pool.writer)
            .await
            .map_err(write_err)?;
        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Signal inbox
    // -----------------------------------------------------------------------

    async fn append_signal(
        &self,
        run_id: &Uuid,
        envelope: &SignalEnvelope,
    ) -> Result<Option<i64>, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"INSERT INTO signals (run_id, delivery_id, signal, received_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(run_id, delivery_id) DO NOTHING
               RETURNING seq"#,
        )
        .bind(run_id.to_string())
        .bind(envelope.delivery_id.to_string())
        .bind(to_json(&envelope.signal)?)
        .bind(format_datetime(&Utc::now()))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(row.map(|(seq,)| seq))
    }

    async fn pending_signals(&self, run_id: &Uuid) -> Result<Vec<SignalRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE run_id = ? AND consumed_at IS NULL ORDER BY seq ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(read_err)?;

        collect(&rows, |row| {
            SignalRow::from_row(row).map_err(read_err)?.into_record()
        })
    }

    async fn mark_signal_consumed(&self, run_id: &Uuid, seq: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE signals SET consumed_at = COALESCE(consumed_at, ?) WHERE run_id = ? AND seq = ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .bind(seq)
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
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
        let result = sqlx::query(
            r#"INSERT INTO gate_decisions (run_id, stage, iteration, decision, decided_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, stage, iteration) DO NOTHING"#,
        )
        .bind(run_id.to_string())
        .bind(stage)
        .bind(iteration as i64)
        .bind(to_json(decision)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(write_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_gate_decision(
        &self,
        run_id: &Uuid,
        stage: &str,
        iteration: u32,
    ) -> Result<Option<GateDecision>, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT decision FROM gate_decisions WHERE run_id = ? AND stage = ? AND iteration = ?",
        )
        .bind(run_id.to_string())
        .bind(stage)
        .bind(iteration as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(read_err)?;

        row.map(|(json,)| parse_json(&json, "gate decision")).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::failure::FailureClass;
    use cadence_types::run::GateKind;
    use cadence_types::signal::ReworkTarget;
    use serde_json::json;

    async fn test_repo() -> (SqlitePipelineRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db")).await.unwrap();
        (SqlitePipelineRepository::new(pool), dir)
    }

    fn digest(c: char) -> Digest {
        c.to_string().repeat(64).parse().unwrap()
    }

    async fn seeded(repo: &SqlitePipelineRepository) -> (Run, Step) {
        let run = Run::new(TenantId::new("acme"), "article", json!({"topic": "rust"}));
        repo.create_run(&run).await.unwrap();
        let step = Step::new(run.id, "analysis/market");
        repo.create_step(&step).await.unwrap();
        (run, step)
    }

    #[tokio::test]
    async fn run_round_trips_with_gate_and_error() {
        let (repo, _dir) = test_repo().await;
        let (run, _) = seeded(&repo).await;

        repo.update_run(
            &run.id,
            &RunUpdate {
                status: RunStatus::WaitingReview,
                current_stage: Some("analysis".into()),
                gate: Some(OpenGate {
                    stage: "analysis".into(),
                    kind: GateKind::Review,
                    iteration: 2,
                }),
                error: None,
            },
        )
        .await
        .unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::WaitingReview);
        assert_eq!(loaded.config, json!({"topic": "rust"}));
        assert_eq!(loaded.gate.unwrap().iteration, 2);
        assert!(loaded.completed_at.is_none());

        repo.update_run(
            &run.id,
            &RunUpdate {
                status: RunStatus::Failed,
                current_stage: Some("analysis".into()),
                gate: None,
                error: Some(RunError {
                    stage: Some("analysis/market".into()),
                    code: "rate_limited".into(),
                    classification: Some(FailureClass::Retryable),
                    attempts: 4,
                    message: "rate limited".into(),
                }),
            },
        )
        .await
        .unwrap();

        let failed = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error.unwrap().attempts, 4);
        assert_eq!(
            repo.list_runs_by_status(RunStatus::Failed).await.unwrap().len(),
            1
        );

        let missing_id = Uuid::now_v7();
        let missing_update = RunUpdate {
            status: RunStatus::Running,
            current_stage: None,
            gate: None,
            error: None,
        };
        let missing = repo.update_run(&missing_id, &missing_update);
        assert!(matches!(missing.await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn list_runs_filters_by_tenant_newest_first() {
        let (repo, _dir) = test_repo().await;
        let first = Run::new(TenantId::new("acme"), "article", json!({}));
        let second = Run::new(TenantId::new("acme"), "article", json!({}));
        let other = Run::new(TenantId::new("globex"), "article", json!({}));
        for run in [&first, &second, &other] {
            repo.create_run(run).await.unwrap();
        }

        let acme = repo.list_runs(Some(&TenantId::new("acme")), 10).await.unwrap();
        assert_eq!(acme.len(), 2);
        assert_eq!(acme[0].id, second.id);
        assert_eq!(repo.list_runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_step_is_conflict() {
        let (repo, _dir) = test_repo().await;
        let (run, step) = seeded(&repo).await;
        let err = repo
            .create_step(&Step::new(run.id, "analysis/market"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let mut revised = step.clone();
        revised.revision = 1;
        revised.retry_count = 1;
        revised.instruction = Some("cite sources".into());
        revised.status = StepStatus::Pending;
        repo.update_step(&revised).await.unwrap();
        let loaded = repo.get_step(&run.id, "analysis/market").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.instruction.as_deref(), Some("cite sources"));
    }

    #[tokio::test]
    async fn second_running_attempt_is_rejected() {
        let (repo, _dir) = test_repo().await;
        let (_, step) = seeded(&repo).await;

        let first = Attempt::begin(step.id, 1, digest('a'));
        repo.insert_attempt(&first).await.unwrap();
        let err = repo
            .insert_attempt(&Attempt::begin(step.id, 2, digest('a')))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        repo.finish_attempt(
            &first.id,
            &AttemptOutcome::Failed {
                classification: FailureClass::Retryable,
                error: "timeout".into(),
                duration_ms: 10,
            },
        )
        .await
        .unwrap();
        // Once the first is terminal a new running attempt is allowed, but not its number.
        let dup = repo
            .insert_attempt(&Attempt::begin(step.id, 1, digest('a')))
            .await
            .unwrap_err();
        assert!(matches!(dup, RepositoryError::Conflict(_)));
        repo.insert_attempt(&Attempt::begin(step.id, 2, digest('a')))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_attempt_is_never_rewritten() {
        let (repo, _dir) = test_repo().await;
        let (_, step) = seeded(&repo).await;
        let attempt = Attempt::begin(step.id, 1, digest('a'));
        repo.insert_attempt(&attempt).await.unwrap();
        repo.record_heartbeat(&attempt.id, Utc::now()).await.unwrap();

        let success = AttemptOutcome::Succeeded {
            output_digest: digest('b'),
            artifact_type: "markdown".into(),
            duration_ms: 42,
            metrics: json!({"output_tokens": 20}),
            warnings: vec!["short".into()],
        };
        repo.finish_attempt(&attempt.id, &success).await.unwrap();
        let err = repo
            .finish_attempt(&attempt.id, &AttemptOutcome::Abandoned { reason: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(matches!(
            repo.finish_attempt(&Uuid::now_v7(), &success).await,
            Err(RepositoryError::NotFound)
        ));

        let stored = &repo.list_attempts(&step.id).await.unwrap()[0];
        assert_eq!(stored.status, AttemptStatus::Succeeded);
        assert_eq!(stored.output_digest, Some(digest('b')));
        assert_eq!(stored.output_type.as_deref(), Some("markdown"));
        assert_eq!(stored.warnings, vec!["short".to_string()]);
        assert!(stored.heartbeat_at.is_some());

        let hits = repo.find_succeeded_attempts(&step.id, &digest('a')).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(repo
            .find_succeeded_attempts(&step.id, &digest('c'))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn artifacts_upsert_and_count_references() {
        let (repo, _dir) = test_repo().await;
        let (run, step) = seeded(&repo).await;
        let artifact = Artifact {
            id: Uuid::now_v7(),
            run_id: run.id,
            step_id: step.id,
            stage_name: step.stage_name.clone(),
            artifact_type: "markdown".into(),
            ref_path: "tenants/acme/runs/x/analysis/market/markdown".into(),
            digest: digest('a'),
            size_bytes: 12,
            metadata: json!({"attempt": 1}),
            created_at: Utc::now(),
        };
        repo.save_artifact(&artifact).await.unwrap();
        repo.save_artifact(&Artifact {
            id: Uuid::now_v7(),
            digest: digest('b'),
            ..artifact.clone()
        })
        .await
        .unwrap();

        let artifacts = repo.list_artifacts(&run.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].digest, digest('b'));
        assert_eq!(repo.count_digest_references(&digest('a')).await.unwrap(), 0);
        assert_eq!(repo.count_digest_references(&digest('b')).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn checkpoints_upsert_per_phase() {
        let (repo, _dir) = test_repo().await;
        let (run, step) = seeded(&repo).await;
        let checkpoint = |phase: &str, data: Value| Checkpoint {
            run_id: run.id,
            stage_name: step.stage_name.clone(),
            phase: phase.into(),
            data,
            input_digest: digest('a'),
            saved_at: Utc::now(),
        };

        repo.save_checkpoint(&checkpoint("outline", json!(["a"]))).await.unwrap();
        repo.save_checkpoint(&checkpoint("outline", json!(["a", "b"]))).await.unwrap();
        repo.save_checkpoint(&checkpoint("sections", json!({}))).await.unwrap();

        let outline = repo
            .get_checkpoint(&run.id, &step.stage_name, "outline")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outline.data, json!(["a", "b"]));
        assert_eq!(repo.delete_checkpoints(&run.id, &step.stage_name).await.unwrap(), 2);
        assert!(repo
            .get_checkpoint(&run.id, &step.stage_name, "outline")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn signal_inbox_dedupes_and_keeps_order() {
        let (repo, _dir) = test_repo().await;
        let (run, _) = seeded(&repo).await;

        let pause = SignalEnvelope::new(Signal::Pause);
        let first = repo.append_signal(&run.id, &pause).await.unwrap();
        assert!(first.is_some());
        assert_eq!(repo.append_signal(&run.id, &pause).await.unwrap(), None);
        repo.append_signal(&run.id, &SignalEnvelope::new(Signal::Continue))
            .await
            .unwrap();

        let pending = repo.pending_signals(&run.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].signal, Signal::Pause);
        assert_eq!(pending[1].signal, Signal::Continue);

        repo.mark_signal_consumed(&run.id, pending[0].seq).await.unwrap();
        let pending = repo.pending_signals(&run.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signal, Signal::Continue);

        let err = repo
            .append_signal(&Uuid::now_v7(), &SignalEnvelope::new(Signal::Cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn first_gate_decision_wins() {
        let (repo, _dir) = test_repo().await;
        let (run, _) = seeded(&repo).await;

        let rework = GateDecision::Reworked {
            targets: vec![ReworkTarget {
                step: "analysis/market".into(),
                instruction: Some("expand".into()),
            }],
        };
        assert!(repo.record_gate_decision(&run.id, "analysis", 1, &rework).await.unwrap());
        assert!(!repo
            .record_gate_decision(&run.id, "analysis", 1, &GateDecision::Approved)
            .await
            .unwrap());
        assert_eq!(
            repo.get_gate_decision(&run.id, "analysis", 1).await.unwrap(),
            Some(rework)
        );
        assert!(repo
            .record_gate_decision(&run.id, "analysis", 2, &GateDecision::Approved)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_run_cascades() {
        let (repo, _dir) = test_repo().await;
        let (run, step) = seeded(&repo).await;
        repo.insert_attempt(&Attempt::begin(step.id, 1, digest('a')))
            .await
            .unwrap();
        repo.append_signal(&run.id, &SignalEnvelope::new(Signal::Pause))
            .await
            .unwrap();
        repo.record_gate_decision(&run.id, "analysis", 1, &GateDecision::Approved)
            .await
            .unwrap();

        assert!(repo.delete_run(&run.id).await.unwrap());
        assert!(!repo.delete_run(&run.id).await.unwrap());
        assert!(repo.get_run(&run.id).await.unwrap().is_none());
        assert!(repo.list_steps(&run.id).await.unwrap().is_empty());
        assert!(repo.list_attempts(&step.id).await.unwrap().is_empty());
        assert!(repo
            .get_gate_decision(&run.id, "analysis", 1)
            .await
            .unwrap()
            .is_none());
    }
}
