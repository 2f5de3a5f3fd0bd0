//! Idempotent execution of one step.
//!
//! `StepExecutor::execute` is the only place stage bodies are invoked. For a
//! `(run, step)` it:
//!
//! 1. gets or creates the step row,
//! 2. computes the input digest over the step's effective inputs,
//! 3. returns the stored artifact if a successful attempt already ran with
//!    that digest (no stage invocation),
//! 4. otherwise begins an attempt (at most one running attempt per step,
//!    enforced by the repository), runs the body under its timeout with an
//!    optional heartbeat, and
//! 5. persists the output through the content-addressed store, or classifies
//!    the failure and retries, quality-retries, or fails the step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::artifact::{Artifact, ArtifactRef, Digest};
use cadence_types::config::EngineConfig;
use cadence_types::error::{RepositoryError, StoreError};
use cadence_types::event::PipelineEvent;
use cadence_types::failure::{FailureClass, StageError};
use cadence_types::pipeline::StageSpec;
use cadence_types::run::Run;
use cadence_types::step::{
    Attempt, AttemptOutcome, AttemptStatus, Step, StepStatus, branch_stage_name,
};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::hashing::{StageInputs, content_digest, input_digest};
use crate::repository::pipeline::PipelineRepository;
use crate::storage::cas::ContentAddressedStore;
use crate::storage::object_store::ObjectStore;
use crate::storage::path::ArtifactPath;

use super::checkpoint::{CheckpointError, CheckpointManager, PhaseCheckpoints};
use super::classifier::ErrorClassifier;
use super::retry::{RetryBudget, RetryDecision, RetryHandler};
use super::stage::{BoxStage, PriorArtifact, StageContext, StageInput, StageOutput, StageRegistry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal failure of a step after its retry budget was spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stage '{stage}' failed after {attempts} attempt(s) [{error_code}]: {message}")]
pub struct StepFailure {
    pub stage: String,
    pub classification: FailureClass,
    pub error_code: String,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no stage body registered for '{0}'")]
    UnknownStage(String),

    /// Another worker holds a live attempt on this step.
    #[error("step '{stage}' already has a running attempt ({attempt_id})")]
    AttemptInFlight { stage: String, attempt_id: Uuid },

    /// Two successful attempts with the same input digest produced different outputs.
    #[error("idempotency conflict on '{stage}': input {input_digest} produced {actual}, previously {expected}")]
    IdempotencyConflict {
        stage: String,
        input_digest: Digest,
        expected: Digest,
        actual: Digest,
    },

    #[error(transparent)]
    StepFailed(#[from] StepFailure),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

fn repo_err(e: RepositoryError) -> ExecutorError {
    ExecutorError::Repository(e.to_string())
}

/// Step name for a stage, or for one branch of it.
pub fn step_name(stage: &StageSpec, branch: Option<&str>) -> String {
    match branch {
        Some(branch) => branch_stage_name(&stage.name, branch),
        None => stage.name.clone(),
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes single steps against the metadata and artifact stores.
pub struct StepExecutor<R: PipelineRepository + 'static, S: ObjectStore + 'static> {
    repo: Arc<R>,
    cas: Arc<ContentAddressedStore<S>>,
    checkpoints: Arc<CheckpointManager<R>>,
    stages: Arc<StageRegistry>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl<R: PipelineRepository + 'static, S: ObjectStore + 'static> StepExecutor<R, S> {
    pub fn new(
        repo: Arc<R>,
        cas: Arc<ContentAddressedStore<S>>,
        checkpoints: Arc<CheckpointManager<R>>,
        stages: Arc<StageRegistry>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repo,
            cas,
            checkpoints,
            stages,
            events,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Retry cap for a stage: its own override or the engine default.
    pub fn max_retries(&self, stage: &StageSpec) -> u32 {
        RetryHandler::max_retries(&self.config, stage.max_retries)
    }

    /// Execute one step and return its artifact.
    ///
    /// `prior` is the artifact set of every earlier stage in pipeline order;
    /// their digests are part of this step's input digest.
    pub async fn execute(
        &self,
        run: &Run,
        stage: &StageSpec,
        branch: Option<&str>,
        prior: &[Artifact],
    ) -> Result<ArtifactRef, ExecutorError> {
        let name = step_name(stage, branch);
        let body = self
            .stages
            .resolve(&stage.name, branch)
            .ok_or_else(|| ExecutorError::UnknownStage(name.clone()))?;
        let mut step = self.get_or_create_step(run.id, &name).await?;

        let digest = input_digest(&StageInputs {
            run_id: run.id,
            stage: &name,
            config: &run.config,
            prior: prior
                .iter()
                .map(|a| (a.stage_name.as_str(), &a.digest))
                .collect(),
            revision: step.revision,
            instruction: step.instruction.as_deref(),
        });

        if let Some(hit) = self.cached_artifact(run, &mut step, &digest).await? {
            return Ok(hit);
        }

        let mut prior_inputs = Vec::with_capacity(prior.len());
        for artifact in prior {
            prior_inputs.push(PriorArtifact {
                artifact: artifact.to_ref(),
                bytes: self.cas.get_by_digest(&run.tenant, &artifact.digest).await?,
            });
        }

        let max_retries = self.max_retries(stage);
        let timeout_secs = self.config.stage_timeout_secs(&stage.name, stage.timeout_secs);
        let mut instructions: Vec<String> = step.instruction.iter().cloned().collect();
        let mut quality_retries = 0;

        loop {
            let attempt = self.begin_attempt(&step, &digest, timeout_secs).await?;
            step.status = StepStatus::Running;
            step.updated_at = Utc::now();
            self.repo.update_step(&step).await.map_err(repo_err)?;

            tracing::info!(
                run_id = %run.id,
                stage = %name,
                attempt = attempt.attempt_num,
                input_digest = digest.short(),
                "starting attempt"
            );
            self.events.publish(PipelineEvent::StageStarted {
                run_id: run.id,
                stage: name.clone(),
                attempt_num: attempt.attempt_num,
            });

            let input = StageInput {
                tenant: run.tenant.clone(),
                run_id: run.id,
                stage: stage.name.clone(),
                branch: branch.map(str::to_string),
                config: run.config.clone(),
                prior: prior_inputs.clone(),
                instructions: instructions.clone(),
                attempt: attempt.attempt_num,
                input_digest: digest.clone(),
            };
            let ctx = StageContext {
                attempt_id: attempt.id,
                checkpoints: PhaseCheckpoints::new(
                    self.checkpoints.clone(),
                    run.id,
                    name.clone(),
                    digest.clone(),
                ),
            };

            let started = Instant::now();
            let result = self
                .invoke(&body, &input, &ctx, run.id, &name, attempt.id, timeout_secs)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match result {
                Ok(output) => {
                    return self
                        .complete_attempt(run, &mut step, &attempt, &digest, output, duration_ms)
                        .await;
                }
                Err(error) => error,
            };

            let classification = ErrorClassifier::classify(&error);
            self.repo
                .finish_attempt(
                    &attempt.id,
                    &AttemptOutcome::Failed {
                        classification: classification.class,
                        error: error.to_string(),
                        duration_ms,
                    },
                )
                .await
                .map_err(repo_err)?;

            let missing = match &error {
                StageError::Validation { missing, .. } => missing.clone(),
                _ => Vec::new(),
            };
            let decision = RetryHandler::decide(
                classification.class,
                RetryBudget {
                    retry_count: step.retry_count,
                    max_retries,
                    quality_retries,
                    max_quality_retries: self.config.max_quality_retries,
                },
                &self.config.backoff,
                ErrorClassifier::retry_after_ms(&error),
                &name,
                &missing,
            );

            self.events.publish(PipelineEvent::StageFailed {
                run_id: run.id,
                stage: name.clone(),
                classification: classification.class,
                error: error.to_string(),
                will_retry: decision != RetryDecision::GiveUp,
            });

            match decision {
                RetryDecision::Backoff { delay } => {
                    step.retry_count += 1;
                    step.updated_at = Utc::now();
                    self.repo.update_step(&step).await.map_err(repo_err)?;
                    tracing::warn!(
                        run_id = %run.id,
                        stage = %name,
                        attempt = attempt.attempt_num,
                        retry = step.retry_count,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::QualityRetry { instruction } => {
                    quality_retries += 1;
                    tracing::warn!(
                        run_id = %run.id,
                        stage = %name,
                        attempt = attempt.attempt_num,
                        missing = ?missing,
                        "output failed validation, retrying with feedback"
                    );
                    instructions.push(instruction);
                }
                RetryDecision::GiveUp => {
                    step.status = StepStatus::Failed;
                    step.error_code = Some(classification.code.to_string());
                    step.updated_at = Utc::now();
                    self.repo.update_step(&step).await.map_err(repo_err)?;

                    let attempts = self.repo.list_attempts(&step.id).await.map_err(repo_err)?;
                    tracing::error!(
                        run_id = %run.id,
                        stage = %name,
                        classification = %classification.class,
                        code = classification.code,
                        attempts = attempts.len(),
                        error = %error,
                        "step failed"
                    );
                    return Err(StepFailure {
                        stage: name,
                        classification: classification.class,
                        error_code: classification.code.to_string(),
                        attempts: attempts.len() as u32,
                        message: error.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// `Some(retry_count)` when the step has used its whole retry budget.
    pub async fn retries_exhausted(
        &self,
        run_id: Uuid,
        stage: &StageSpec,
        name: &str,
    ) -> Result<Option<u32>, ExecutorError> {
        let step = self.get_or_create_step(run_id, name).await?;
        Ok((step.retry_count >= self.max_retries(stage)).then_some(step.retry_count))
    }

    /// Re-arm a step for another execution with a correction instruction.
    ///
    /// Bumps `revision` (which changes the input digest) and `retry_count`.
    /// Callers check the retry cap before calling.
    pub async fn revise_step(
        &self,
        run_id: Uuid,
        name: &str,
        instruction: Option<&str>,
    ) -> Result<Step, ExecutorError> {
        let mut step = self.get_or_create_step(run_id, name).await?;
        step.revision += 1;
        step.retry_count += 1;
        step.instruction = instruction.map(str::to_string);
        step.status = StepStatus::Pending;
        step.error_code = None;
        step.updated_at = Utc::now();
        self.repo.update_step(&step).await.map_err(repo_err)?;

        tracing::info!(
            run_id = %run_id,
            stage = name,
            revision = step.revision,
            retry_count = step.retry_count,
            "step revised"
        );
        Ok(step)
    }

    pub async fn get_or_create_step(&self, run_id: Uuid, name: &str) -> Result<Step, ExecutorError> {
        if let Some(step) = self.repo.get_step(&run_id, name).await.map_err(repo_err)? {
            return Ok(step);
        }
        let step = Step::new(run_id, name);
        match self.repo.create_step(&step).await {
            Ok(()) => Ok(step),
            // Lost the creation race; the winner's row is authoritative.
            Err(RepositoryError::Conflict(_)) => self
                .repo
                .get_step(&run_id, name)
                .await
                .map_err(repo_err)?
                .ok_or_else(|| ExecutorError::Repository(format!("step '{name}' vanished"))),
            Err(e) => Err(repo_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Artifact of an earlier successful attempt with the same input digest.
    async fn cached_artifact(
        &self,
        run: &Run,
        step: &mut Step,
        digest: &Digest,
    ) -> Result<Option<ArtifactRef>, ExecutorError> {
        let succeeded = self
            .repo
            .find_succeeded_attempts(&step.id, digest)
            .await
            .map_err(repo_err)?;
        let Some(done) = succeeded.iter().rev().find(|a| a.output_digest.is_some()) else {
            return Ok(None);
        };
        let Some(output) = done.output_digest.clone() else {
            return Ok(None);
        };

        let artifacts = self.repo.list_artifacts(&run.id).await.map_err(repo_err)?;
        let found = artifacts
            .into_iter()
            .rev()
            .find(|a| a.step_id == step.id && a.digest == output);
        let artifact = match (found, done.output_type.as_deref()) {
            (Some(artifact), _) => artifact,
            (None, Some(artifact_type)) => {
                self.restore_artifact(run, step, &output, artifact_type).await?
            }
            (None, None) => return Ok(None),
        };

        if step.status != StepStatus::Completed {
            step.status = StepStatus::Completed;
            step.error_code = None;
            step.updated_at = Utc::now();
            self.repo.update_step(step).await.map_err(repo_err)?;
        }

        tracing::debug!(
            run_id = %run.id,
            stage = %step.stage_name,
            digest = artifact.digest.short(),
            "input digest already satisfied, skipping stage"
        );
        self.events.publish(PipelineEvent::StageCacheHit {
            run_id: run.id,
            stage: step.stage_name.clone(),
            digest: artifact.digest.clone(),
        });
        Ok(Some(artifact.to_ref()))
    }

    /// Rebuild the artifact row of a succeeded attempt whose row was never
    /// written, pointing its path back at the stored blob.
    async fn restore_artifact(
        &self,
        run: &Run,
        step: &Step,
        output: &Digest,
        artifact_type: &str,
    ) -> Result<Artifact, ExecutorError> {
        let path = ArtifactPath::new(&run.tenant, run.id, &step.stage_name, artifact_type)?;
        self.cas.link(output, &path).await?;
        let bytes = self.cas.get_by_digest(&run.tenant, output).await?;

        let artifact = Artifact {
            id: Uuid::now_v7(),
            run_id: run.id,
            step_id: step.id,
            stage_name: step.stage_name.clone(),
            artifact_type: artifact_type.to_string(),
            ref_path: path.to_string(),
            digest: output.clone(),
            size_bytes: bytes.len() as u64,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        self.repo.save_artifact(&artifact).await.map_err(repo_err)?;
        tracing::warn!(
            run_id = %run.id,
            stage = %step.stage_name,
            digest = output.short(),
            "restored missing artifact row"
        );
        Ok(artifact)
    }

    /// Insert the next running attempt, reaping a stale one if it blocks us.
    async fn begin_attempt(
        &self,
        step: &Step,
        digest: &Digest,
        timeout_secs: u64,
    ) -> Result<Attempt, ExecutorError> {
        for _ in 0..2 {
            let existing = self.repo.list_attempts(&step.id).await.map_err(repo_err)?;
            let next = existing.iter().map(|a| a.attempt_num).max().unwrap_or(0) + 1;
            let attempt = Attempt::begin(step.id, next, digest.clone());

            match self.repo.insert_attempt(&attempt).await {
                Ok(()) => return Ok(attempt),
                Err(RepositoryError::Conflict(_)) => {}
                Err(e) => return Err(repo_err(e)),
            }

            let attempts = self.repo.list_attempts(&step.id).await.map_err(repo_err)?;
            let Some(running) = attempts
                .into_iter()
                .find(|a| a.status == AttemptStatus::Running)
            else {
                // Lost a race on the attempt number only.
                continue;
            };

            if !self.is_stale(&running, timeout_secs) {
                return Err(ExecutorError::AttemptInFlight {
                    stage: step.stage_name.clone(),
                    attempt_id: running.id,
                });
            }

            tracing::warn!(
                stage = %step.stage_name,
                attempt_id = %running.id,
                attempt = running.attempt_num,
                "abandoning stale attempt"
            );
            let outcome = AttemptOutcome::Abandoned {
                reason: "heartbeat expired".to_string(),
            };
            match self.repo.finish_attempt(&running.id, &outcome).await {
                Ok(()) | Err(RepositoryError::Conflict(_)) => {}
                Err(e) => return Err(repo_err(e)),
            }
        }

        Err(ExecutorError::Repository(format!(
            "could not begin an attempt for step '{}'",
            step.stage_name
        )))
    }

    /// A running attempt is stale once its last sign of life is older than the
    /// threshold. Attempts without heartbeats get at least their own timeout.
    fn is_stale(&self, attempt: &Attempt, timeout_secs: u64) -> bool {
        let heartbeats = timeout_secs > self.config.heartbeat_threshold_secs;
        let threshold = if heartbeats {
            self.config.stale_attempt_secs
        } else {
            self.config.stale_attempt_secs.max(timeout_secs)
        };
        let last_seen = attempt.heartbeat_at.unwrap_or(attempt.started_at);
        Utc::now().signed_duration_since(last_seen).num_seconds() > threshold as i64
    }

    /// Run the body under its timeout, heartbeating if the timeout is long.
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        body: &BoxStage,
        input: &StageInput,
        ctx: &StageContext,
        run_id: Uuid,
        name: &str,
        attempt_id: Uuid,
        timeout_secs: u64,
    ) -> Result<StageOutput, StageError> {
        let heartbeat = (timeout_secs > self.config.heartbeat_threshold_secs)
            .then(|| self.spawn_heartbeat(run_id, name.to_string(), attempt_id));

        let result =
            tokio::time::timeout(Duration::from_secs(timeout_secs), body.run(input, ctx)).await;

        if let Some((token, handle)) = heartbeat {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(run_id = %run_id, stage = name, error = %e, "heartbeat task failed");
            }
        }

        match result {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                after_secs: timeout_secs,
            }),
        }
    }

    fn spawn_heartbeat(
        &self,
        run_id: Uuid,
        stage: String,
        attempt_id: Uuid,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let stop = token.clone();
        let repo = self.repo.clone();
        let events = self.events.clone();
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = repo.record_heartbeat(&attempt_id, Utc::now()).await {
                            tracing::warn!(attempt_id = %attempt_id, error = %e, "failed to record heartbeat");
                        }
                        tracing::trace!(run_id = %run_id, stage = %stage, "heartbeat");
                        events.publish(PipelineEvent::Heartbeat {
                            run_id,
                            stage: stage.clone(),
                            attempt_id,
                        });
                    }
                }
            }
        });
        (token, handle)
    }

    /// Persist a successful output and close the attempt.
    ///
    /// The blob and the artifact row are written before the attempt is marked
    /// succeeded, so a succeeded attempt always has its output stored.
    async fn complete_attempt(
        &self,
        run: &Run,
        step: &mut Step,
        attempt: &Attempt,
        digest: &Digest,
        output: StageOutput,
        duration_ms: u64,
    ) -> Result<ArtifactRef, ExecutorError> {
        let output_digest = content_digest(&output.bytes);

        let previous = self
            .repo
            .find_succeeded_attempts(&step.id, digest)
            .await
            .map_err(repo_err)?;
        if let Some(expected) = previous
            .iter()
            .filter_map(|a| a.output_digest.as_ref())
            .find(|d| *d != &output_digest)
        {
            let expected = expected.clone();
            self.fail_attempt(attempt, "idempotency conflict".to_string(), duration_ms)
                .await?;
            self.mark_failed(step, "idempotency_conflict").await?;

            tracing::error!(
                run_id = %run.id,
                stage = %step.stage_name,
                input_digest = digest.as_str(),
                expected = expected.as_str(),
                actual = output_digest.as_str(),
                "same inputs produced a different output"
            );
            return Err(ExecutorError::IdempotencyConflict {
                stage: step.stage_name.clone(),
                input_digest: digest.clone(),
                expected,
                actual: output_digest,
            });
        }

        let stored = async {
            let path =
                ArtifactPath::new(&run.tenant, run.id, &step.stage_name, &output.artifact_type)?;
            self.cas.put(&output.bytes, &path).await?;
            Ok::<_, StoreError>(path)
        }
        .await;
        let path = match stored {
            Ok(path) => path,
            Err(e) => {
                self.fail_attempt(attempt, format!("artifact store error: {e}"), duration_ms)
                    .await?;
                self.mark_failed(step, "artifact_store_error").await?;
                tracing::error!(
                    run_id = %run.id,
                    stage = %step.stage_name,
                    error = %e,
                    "could not store stage output"
                );
                return Err(e.into());
            }
        };

        for warning in &output.warnings {
            tracing::warn!(run_id = %run.id, stage = %step.stage_name, warning = %warning, "stage warning");
        }

        let artifact = Artifact {
            id: Uuid::now_v7(),
            run_id: run.id,
            step_id: step.id,
            stage_name: step.stage_name.clone(),
            artifact_type: output.artifact_type.clone(),
            ref_path: path.to_string(),
            digest: output_digest.clone(),
            size_bytes: output.bytes.len() as u64,
            metadata: output.metadata,
            created_at: Utc::now(),
        };
        self.repo.save_artifact(&artifact).await.map_err(repo_err)?;

        self.repo
            .finish_attempt(
                &attempt.id,
                &AttemptOutcome::Succeeded {
                    output_digest: output_digest.clone(),
                    artifact_type: output.artifact_type,
                    duration_ms,
                    metrics: output.metrics,
                    warnings: output.warnings,
                },
            )
            .await
            .map_err(repo_err)?;

        step.status = StepStatus::Completed;
        step.error_code = None;
        step.updated_at = Utc::now();
        self.repo.update_step(step).await.map_err(repo_err)?;
        self.checkpoints.clear(run.id, &step.stage_name).await?;

        tracing::info!(
            run_id = %run.id,
            stage = %step.stage_name,
            attempt = attempt.attempt_num,
            digest = output_digest.short(),
            duration_ms,
            "step completed"
        );
        self.events.publish(PipelineEvent::StageCompleted {
            run_id: run.id,
            stage: step.stage_name.clone(),
            digest: output_digest,
            duration_ms,
        });
        Ok(artifact.to_ref())
    }

    async fn mark_failed(&self, step: &mut Step, code: &str) -> Result<(), ExecutorError> {
        step.status = StepStatus::Failed;
        step.error_code = Some(code.to_string());
        step.updated_at = Utc::now();
        self.repo.update_step(step).await.map_err(repo_err)
    }

    async fn fail_attempt(
        &self,
        attempt: &Attempt,
        error: String,
        duration_ms: u64,
    ) -> Result<(), ExecutorError> {
        self.repo
            .finish_attempt(
                &attempt.id,
                &AttemptOutcome::Failed {
                    classification: FailureClass::NonRetryable,
                    error,
                    duration_ms,
                },
            )
            .await
            .map_err(repo_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
