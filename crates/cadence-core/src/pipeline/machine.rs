//! The run state machine.
//!
//! A run moves `pending -> running -> {waiting_approval, waiting_review,
//! paused} -> running -> {completed, failed, cancelled}`. The machine is
//! re-entrant and deterministic: `drive` reloads the persisted run on every
//! step and branches only on persisted state (the run row, step and attempt
//! outcomes, the signal inbox and recorded gate decisions). Any process can
//! pick up a run after a crash by calling `drive` again.
//!
//! Signals are consumed only at suspension points and at stage boundaries;
//! a stage in flight always finishes before a signal takes effect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cadence_types::artifact::{Artifact, Digest};
use cadence_types::config::EngineConfig;
use cadence_types::error::{RepositoryError, StoreError};
use cadence_types::event::PipelineEvent;
use cadence_types::failure::FailureClass;
use cadence_types::pipeline::{PipelineDefinition, StageSpec};
use cadence_types::run::{OpenGate, Run, RunError, RunStatus, RunUpdate, TenantId};
use cadence_types::signal::{
    GateDecision, ReworkTarget, Signal, SignalEnvelope, SignalRecord, StageReview,
};
use cadence_types::step::{BRANCH_SEPARATOR, Step, StepStatus};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::pipeline::PipelineRepository;
use crate::storage::cas::ContentAddressedStore;
use crate::storage::object_store::ObjectStore;
use crate::storage::path::ArtifactPath;

use super::branch::{BranchError, ParallelBranchCoordinator};
use super::checkpoint::CheckpointManager;
use super::executor::{ExecutorError, StepExecutor, StepFailure, step_name};
use super::stage::StageRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("pipeline has no stage '{0}'")]
    UnknownStage(String),

    #[error("run {run_id} belongs to pipeline '{actual}', not '{expected}'")]
    PipelineMismatch {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("cannot {operation} run {run_id} while it is {status}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        operation: &'static str,
    },

    /// A step before the resume point has no completed artifact to share.
    #[error("cannot resume: step '{0}' has no completed artifact")]
    IncompleteHistory(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Branch(#[from] BranchError),
}

fn repo_err(e: RepositoryError) -> MachineError {
    MachineError::Repository(e.to_string())
}

/// What `delete_run` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub run_id: Uuid,
    pub pointers_removed: usize,
    pub blobs_removed: usize,
    /// Blobs kept because another run still references them.
    pub blobs_shared: usize,
}

/// A gate-type signal translated into a decision, or rejected as inapplicable.
enum Proposal {
    Decide(GateDecision),
    Ignore(String),
}

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

pub struct RunStateMachine<R: PipelineRepository + 'static, S: ObjectStore + 'static> {
    repo: Arc<R>,
    cas: Arc<ContentAddressedStore<S>>,
    executor: Arc<StepExecutor<R, S>>,
    branches: ParallelBranchCoordinator<R, S>,
    pipeline: Arc<PipelineDefinition>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl<R: PipelineRepository + 'static, S: ObjectStore + 'static> RunStateMachine<R, S> {
    pub fn new(
        repo: Arc<R>,
        cas: Arc<ContentAddressedStore<S>>,
        stages: StageRegistry,
        pipeline: Arc<PipelineDefinition>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        let executor = Arc::new(StepExecutor::new(
            repo.clone(),
            cas.clone(),
            Arc::new(CheckpointManager::new(repo.clone())),
            Arc::new(stages),
            events.clone(),
            config.clone(),
        ));
        let branches = ParallelBranchCoordinator::new(executor.clone(), repo.clone());
        Self {
            repo,
            cas,
            executor,
            branches,
            pipeline,
            events,
            config,
        }
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn executor(&self) -> &Arc<StepExecutor<R, S>> {
        &self.executor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create a pending run of this pipeline.
    pub async fn submit(&self, tenant: TenantId, config: Value) -> Result<Run, MachineError> {
        let run = Run::new(tenant, self.pipeline.name.clone(), config);
        self.repo.create_run(&run).await.map_err(repo_err)?;
        tracing::info!(run_id = %run.id, tenant = %run.tenant, pipeline = %run.pipeline, "run submitted");
        Ok(run)
    }

    /// Append a signal to the run's inbox. Returns `false` for a duplicate delivery.
    pub async fn deliver(&self, run_id: Uuid, envelope: SignalEnvelope) -> Result<bool, MachineError> {
        self.load_run(run_id).await?;
        match self
            .repo
            .append_signal(&run_id, &envelope)
            .await
            .map_err(repo_err)?
        {
            Some(seq) => {
                tracing::info!(run_id = %run_id, seq, signal = %envelope.signal, "signal received");
                Ok(true)
            }
            None => {
                tracing::debug!(
                    run_id = %run_id,
                    delivery_id = %envelope.delivery_id,
                    "duplicate signal delivery dropped"
                );
                Ok(false)
            }
        }
    }

    /// Advance a run until it is terminal or suspended with an empty inbox.
    pub async fn drive(&self, run_id: Uuid) -> Result<RunStatus, MachineError> {
        loop {
            let run = self.load_run(run_id).await?;
            self.check_pipeline(&run)?;

            match run.status {
                RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                    self.drain_terminal(&run).await?;
                    return Ok(run.status);
                }
                RunStatus::Pending => self.start(&run).await?,
                RunStatus::Running => self.advance(&run).await?,
                RunStatus::Paused | RunStatus::WaitingApproval | RunStatus::WaitingReview => {
                    if !self.handle_suspended(&run).await? {
                        return Ok(run.status);
                    }
                }
            }
        }
    }

    /// Start a new run that shares, by reference, every artifact produced
    /// before `stage` in `run_id`. The original run is not modified.
    pub async fn resume_from(&self, run_id: Uuid, stage: &str) -> Result<Run, MachineError> {
        let original = self.load_run(run_id).await?;
        self.check_pipeline(&original)?;
        if matches!(original.status, RunStatus::Pending | RunStatus::Running) {
            return Err(MachineError::InvalidState {
                run_id,
                status: original.status,
                operation: "resume",
            });
        }
        let index = self
            .pipeline
            .stage_index(stage)
            .ok_or_else(|| MachineError::UnknownStage(stage.to_string()))?;

        // Collect everything first so a gap aborts before anything is written.
        let steps = self.repo.list_steps(&run_id).await.map_err(repo_err)?;
        let artifacts = self.repo.list_artifacts(&run_id).await.map_err(repo_err)?;
        let mut shared: Vec<(Step, Artifact)> = Vec::new();
        for spec in &self.pipeline.stages[..index] {
            for name in spec.step_names() {
                let step = steps
                    .iter()
                    .find(|s| s.stage_name == name && s.status == StepStatus::Completed)
                    .ok_or_else(|| MachineError::IncompleteHistory(name.clone()))?;
                let artifact = latest_artifact(&artifacts, &name)
                    .ok_or_else(|| MachineError::IncompleteHistory(name.clone()))?;
                shared.push((step.clone(), artifact.clone()));
            }
        }

        let mut fork = Run::new(
            original.tenant.clone(),
            original.pipeline.clone(),
            original.config.clone(),
        );
        fork.parent_run_id = Some(run_id);
        fork.resumed_from = Some(stage.to_string());
        fork.status = RunStatus::Running;
        fork.current_stage = Some(stage.to_string());
        self.repo.create_run(&fork).await.map_err(repo_err)?;

        for (step, artifact) in shared {
            let mut copy = Step::new(fork.id, step.stage_name.clone());
            copy.status = StepStatus::Completed;
            copy.revision = step.revision;
            copy.instruction = step.instruction.clone();
            self.repo.create_step(&copy).await.map_err(repo_err)?;

            let path = ArtifactPath::new(
                &fork.tenant,
                fork.id,
                &artifact.stage_name,
                &artifact.artifact_type,
            )?;
            self.cas.link(&artifact.digest, &path).await?;
            let linked = Artifact {
                id: Uuid::now_v7(),
                run_id: fork.id,
                step_id: copy.id,
                ref_path: path.to_string(),
                created_at: Utc::now(),
                ..artifact
            };
            self.repo.save_artifact(&linked).await.map_err(repo_err)?;
        }

        tracing::info!(
            parent_run_id = %run_id,
            run_id = %fork.id,
            from_stage = stage,
            "run resumed into new run"
        );
        self.events.publish(PipelineEvent::RunForked {
            parent_run_id: run_id,
            run_id: fork.id,
            from_stage: stage.to_string(),
        });
        Ok(fork)
    }

    /// Delete a run with its metadata and pointers, plus every blob of the
    /// tenant that no other run of the tenant references.
    pub async fn delete_run(&self, run_id: Uuid) -> Result<DeleteReport, MachineError> {
        let run = self.load_run(run_id).await?;
        if run.status == RunStatus::Running {
            return Err(MachineError::InvalidState {
                run_id,
                status: run.status,
                operation: "delete",
            });
        }

        // Outputs of every revision, not only the ones artifact rows still point at.
        let mut pointers: BTreeSet<(String, String)> = BTreeSet::new();
        let mut digests: BTreeSet<Digest> = BTreeSet::new();
        for artifact in self.repo.list_artifacts(&run_id).await.map_err(repo_err)? {
            pointers.insert((artifact.stage_name, artifact.artifact_type));
            digests.insert(artifact.digest);
        }
        for step in self.repo.list_steps(&run_id).await.map_err(repo_err)? {
            for attempt in self.repo.list_attempts(&step.id).await.map_err(repo_err)? {
                if let Some(artifact_type) = attempt.output_type {
                    pointers.insert((step.stage_name.clone(), artifact_type));
                }
                digests.extend(attempt.output_digest);
            }
        }

        let mut report = DeleteReport {
            run_id,
            ..DeleteReport::default()
        };
        for (stage, artifact_type) in &pointers {
            let path = ArtifactPath::new(&run.tenant, run_id, stage, artifact_type)?;
            if self.cas.unlink(&path).await? {
                report.pointers_removed += 1;
            }
        }

        self.repo.delete_run(&run_id).await.map_err(repo_err)?;

        // Reference counts come from this tenant's store, so only this
        // tenant's blob area is touched.
        for digest in digests {
            if self
                .repo
                .count_digest_references(&digest)
                .await
                .map_err(repo_err)?
                > 0
            {
                report.blobs_shared += 1;
            } else if self.cas.remove_blob(&run.tenant, &digest).await? {
                report.blobs_removed += 1;
            }
        }

        tracing::info!(
            run_id = %run_id,
            pointers = report.pointers_removed,
            blobs_removed = report.blobs_removed,
            blobs_shared = report.blobs_shared,
            "run deleted"
        );
        Ok(report)
    }

    /// Runs left `running` by a process that stopped mid-stage.
    pub async fn interrupted_runs(&self) -> Result<Vec<Run>, MachineError> {
        let runs = self
            .repo
            .list_runs_by_status(RunStatus::Running)
            .await
            .map_err(repo_err)?;
        Ok(runs
            .into_iter()
            .filter(|r| r.pipeline == self.pipeline.name)
            .collect())
    }

    /// Drive every interrupted run of this pipeline. Per-run failures are logged
    /// and reported, not propagated.
    pub async fn recover(&self) -> Result<Vec<(Uuid, Result<RunStatus, String>)>, MachineError> {
        let mut results = Vec::new();
        for run in self.interrupted_runs().await? {
            tracing::info!(run_id = %run.id, stage = ?run.current_stage, "recovering interrupted run");
            let outcome = self.drive(run.id).await.map_err(|e| {
                tracing::error!(run_id = %run.id, error = %e, "recovery failed");
                e.to_string()
            });
            results.push((run.id, outcome));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    async fn start(&self, run: &Run) -> Result<(), MachineError> {
        let Some(first) = self.pipeline.stages.first() else {
            return self.complete(run).await;
        };
        self.update(
            run,
            RunStatus::Running,
            Some(first.name.clone()),
            None,
            None,
        )
        .await?;
        tracing::info!(run_id = %run.id, pipeline = %run.pipeline, "run started");
        self.events.publish(PipelineEvent::RunStarted {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
        });
        Ok(())
    }

    /// One stage boundary: honor pause/cancel, then execute the current stage.
    async fn advance(&self, run: &Run) -> Result<(), MachineError> {
        let pending = self.pending(run).await?;
        if let Some(record) = pending
            .iter()
            .find(|r| matches!(r.signal, Signal::Pause | Signal::Cancel))
        {
            self.consume(run, record).await?;
            return match record.signal {
                Signal::Cancel => self.cancel(run).await,
                _ => self.pause(run).await,
            };
        }

        let Some(stage_name) = run.current_stage.clone() else {
            return self.complete(run).await;
        };
        let (index, stage) = match self.pipeline.stage_index(&stage_name) {
            Some(index) => (index, self.pipeline.stages[index].clone()),
            None => {
                let error = run_error(&stage_name, "unknown_stage", None, 0, "stage is not in the pipeline");
                return self.fail(run, error).await;
            }
        };
        let prior = self.prior_artifacts(run, index).await?;

        let failure = if stage.is_parallel() {
            match self.branches.run_stage(run, &stage, &prior).await {
                Ok(report) => report.failures().next().map(|(_, f)| failure_error(f)),
                Err(BranchError::Executor { source, .. }) => Some(stage_failure(source)?),
                Err(e) => return Err(e.into()),
            }
        } else {
            match self.executor.execute(run, &stage, None, &prior).await {
                Ok(_) => None,
                Err(e) => Some(stage_failure(e)?),
            }
        };

        match failure {
            None => self.after_stage(run, &stage).await,
            Some(error) => self.fail(run, error).await,
        }
    }

    async fn after_stage(&self, run: &Run, stage: &StageSpec) -> Result<(), MachineError> {
        match stage.gate {
            Some(kind) => {
                let iteration = self.next_gate_iteration(run.id, &stage.name).await?;
                let status = kind.waiting_status();
                self.update(
                    run,
                    status,
                    Some(stage.name.clone()),
                    Some(OpenGate {
                        stage: stage.name.clone(),
                        kind,
                        iteration,
                    }),
                    None,
                )
                .await?;
                tracing::info!(run_id = %run.id, stage = %stage.name, iteration, status = %status, "gate opened");
                self.events.publish(PipelineEvent::RunSuspended {
                    run_id: run.id,
                    status,
                    stage: Some(stage.name.clone()),
                });
                Ok(())
            }
            None => self.advance_past(run, &stage.name).await,
        }
    }

    async fn advance_past(&self, run: &Run, stage_name: &str) -> Result<(), MachineError> {
        let next = self
            .pipeline
            .stage_index(stage_name)
            .and_then(|i| self.pipeline.stages.get(i + 1));
        match next {
            Some(next) => {
                self.update(run, RunStatus::Running, Some(next.name.clone()), None, None)
                    .await
            }
            None => self.complete(run).await,
        }
    }

    // -----------------------------------------------------------------------
    // Suspended
    // -----------------------------------------------------------------------

    /// Apply the oldest pending signal. Returns `false` when there is nothing to do.
    async fn handle_suspended(&self, run: &Run) -> Result<bool, MachineError> {
        // A decision recorded by a process that stopped before applying it.
        let recorded = match &run.gate {
            Some(gate) => self
                .repo
                .get_gate_decision(&run.id, &gate.stage, gate.iteration)
                .await
                .map_err(repo_err)?
                .map(|decision| (gate, decision)),
            None => None,
        };
        if let Some((gate, decision)) = recorded {
            tracing::info!(
                run_id = %run.id,
                stage = %gate.stage,
                iteration = gate.iteration,
                decision = decision.kind(),
                "applying previously recorded gate decision"
            );
            self.apply_decision(run, gate, &decision).await?;
            self.drain_gate_signals(run).await?;
            return Ok(true);
        }

        let pending = self.pending(run).await?;
        let Some(record) = pending.first() else {
            return Ok(false);
        };

        if run.status == RunStatus::Paused {
            self.handle_paused(run, record).await?;
        } else {
            self.handle_gate(run, record).await?;
        }
        Ok(true)
    }

    async fn handle_paused(&self, run: &Run, record: &SignalRecord) -> Result<(), MachineError> {
        match &record.signal {
            Signal::Continue => {
                self.consume(run, record).await?;
                tracing::info!(run_id = %run.id, "run continued");
                self.update(run, RunStatus::Running, run.current_stage.clone(), None, None)
                    .await
            }
            Signal::Cancel => {
                self.consume(run, record).await?;
                self.cancel(run).await
            }
            Signal::RetryStage { stage, instruction } => {
                let limit = run
                    .current_stage
                    .as_deref()
                    .and_then(|s| self.pipeline.stage_index(s))
                    .unwrap_or(self.pipeline.stages.len().saturating_sub(1));
                match self.resolve_targets(&[(stage.clone(), instruction.clone())], limit) {
                    Ok(targets) => {
                        self.consume(run, record).await?;
                        self.rework(run, &targets).await
                    }
                    Err(reason) => self.ignore(run, record, &reason).await,
                }
            }
            Signal::ResumeFrom { stage } => {
                self.consume(run, record).await?;
                self.fork_on_signal(run, stage).await
            }
            Signal::Pause
            | Signal::Approve
            | Signal::Reject { .. }
            | Signal::RejectWithInstructions { .. }
            | Signal::StageReview { .. } => self.ignore(run, record, "run is paused").await,
        }
    }

    async fn handle_gate(&self, run: &Run, record: &SignalRecord) -> Result<(), MachineError> {
        let Some(gate) = run.gate.clone() else {
            return Err(MachineError::InvalidState {
                run_id: run.id,
                status: run.status,
                operation: "decide gate of",
            });
        };

        let proposal = match &record.signal {
            Signal::Cancel => {
                self.consume(run, record).await?;
                return self.cancel(run).await;
            }
            Signal::ResumeFrom { stage } => {
                self.consume(run, record).await?;
                return self.fork_on_signal(run, stage).await;
            }
            Signal::Pause | Signal::Continue => {
                return self.ignore(run, record, "run is waiting at a gate").await;
            }
            Signal::Approve => Proposal::Decide(GateDecision::Approved),
            Signal::Reject { reason } => Proposal::Decide(GateDecision::Rejected {
                reason: reason.clone(),
            }),
            Signal::RejectWithInstructions { per_stage } => {
                let requested: Vec<(String, Option<String>)> = per_stage
                    .iter()
                    .map(|(stage, text)| (stage.clone(), Some(text.clone())))
                    .collect();
                self.rework_proposal(&gate, &requested)
            }
            Signal::StageReview { reviews } => self.review_proposal(&gate, reviews),
            Signal::RetryStage { stage, instruction } => {
                self.rework_proposal(&gate, &[(stage.clone(), instruction.clone())])
            }
        };

        let decision = match proposal {
            Proposal::Decide(decision) => decision,
            Proposal::Ignore(reason) => return self.ignore(run, record, &reason).await,
        };

        let recorded = self
            .repo
            .record_gate_decision(&run.id, &gate.stage, gate.iteration, &decision)
            .await
            .map_err(repo_err)?;
        let decision = if recorded {
            decision
        } else {
            // Another writer decided first; its decision stands.
            let existing = self
                .repo
                .get_gate_decision(&run.id, &gate.stage, gate.iteration)
                .await
                .map_err(repo_err)?
                .unwrap_or(decision);
            tracing::warn!(
                run_id = %run.id,
                stage = %gate.stage,
                iteration = gate.iteration,
                decision = existing.kind(),
                "gate already decided"
            );
            existing
        };

        self.consume(run, record).await?;
        tracing::info!(
            run_id = %run.id,
            stage = %gate.stage,
            iteration = gate.iteration,
            decision = decision.kind(),
            signal = %record.signal,
            "gate decided"
        );
        self.apply_decision(run, &gate, &decision).await?;
        self.drain_gate_signals(run).await
    }

    async fn apply_decision(
        &self,
        run: &Run,
        gate: &OpenGate,
        decision: &GateDecision,
    ) -> Result<(), MachineError> {
        match decision {
            GateDecision::Approved => self.advance_past(run, &gate.stage).await,
            GateDecision::Rejected { reason } => {
                self.fail(
                    run,
                    run_error(&gate.stage, "rejected", None, 0, reason),
                )
                .await
            }
            GateDecision::Reworked { targets } => {
                if gate.iteration > self.config.max_review_iterations {
                    return self
                        .fail(
                            run,
                            run_error(
                                &gate.stage,
                                "review_iterations_exhausted",
                                None,
                                0,
                                &format!(
                                    "gate sent back {} times (limit {})",
                                    gate.iteration, self.config.max_review_iterations
                                ),
                            ),
                        )
                        .await;
                }
                self.rework(run, targets).await
            }
        }
    }

    /// Revise the targeted steps and rewind the run to the earliest of them.
    ///
    /// Branches of a parallel stage go through the branch coordinator. When
    /// that stage is the rewind point its branches run again right away,
    /// alone; a later stage's branches are only re-armed.
    async fn rework(&self, run: &Run, targets: &[ReworkTarget]) -> Result<(), MachineError> {
        let mut by_stage: BTreeMap<usize, (&StageSpec, Vec<(String, Option<String>)>)> =
            BTreeMap::new();
        for target in targets {
            let stage = self.stage_of(&target.step)?;
            let index = self
                .pipeline
                .stage_index(&stage.name)
                .ok_or_else(|| MachineError::UnknownStage(stage.name.clone()))?;
            let key = match target.step.split_once(BRANCH_SEPARATOR) {
                Some((_, branch)) => branch.to_string(),
                None => target.step.clone(),
            };
            by_stage
                .entry(index)
                .or_insert_with(|| (stage, Vec::new()))
                .1
                .push((key, target.instruction.clone()));
        }

        // Check every cap before touching anything.
        for (stage, subset) in by_stage.values() {
            let capped = if stage.is_parallel() {
                match self.branches.check_retry_caps(run, stage, subset).await {
                    Ok(()) => None,
                    Err(BranchError::RetryCapExceeded { branch, retries, .. }) => {
                        Some((step_name(stage, Some(&branch)), retries))
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                self.executor
                    .retries_exhausted(run.id, stage, &stage.name)
                    .await?
                    .map(|retries| (stage.name.clone(), retries))
            };
            if let Some((step, retries)) = capped {
                let max_retries = self.executor.max_retries(stage);
                return self
                    .fail(
                        run,
                        run_error(
                            &step,
                            "retry_cap_exceeded",
                            None,
                            retries,
                            &format!("step already used {retries} of {max_retries} retries"),
                        ),
                    )
                    .await;
            }
        }

        let restart = by_stage
            .values()
            .next()
            .map(|(stage, _)| stage.name.clone())
            .or_else(|| run.current_stage.clone());
        tracing::info!(
            run_id = %run.id,
            steps = ?targets.iter().map(|t| t.step.as_str()).collect::<Vec<_>>(),
            restart = ?restart,
            "reworking steps"
        );

        let mut rerun = None;
        for (position, (index, (stage, subset))) in by_stage.iter().enumerate() {
            if !stage.is_parallel() {
                for (name, instruction) in subset {
                    self.executor
                        .revise_step(run.id, name, instruction.as_deref())
                        .await?;
                }
            } else if position == 0 {
                rerun = Some((*index, *stage, subset));
            } else {
                self.branches.revise_branches(run, stage, subset).await?;
            }
        }

        self.update(run, RunStatus::Running, restart, None, None).await?;
        let Some((index, stage, subset)) = rerun else {
            return Ok(());
        };

        let run = self.load_run(run.id).await?;
        let prior = self.prior_artifacts(&run, index).await?;
        let failure = match self.branches.retry_branches(&run, stage, &prior, subset).await {
            Ok(report) => report.failures().next().map(|(_, f)| failure_error(f)),
            Err(BranchError::Executor { source, .. }) => Some(stage_failure(source)?),
            Err(e) => return Err(e.into()),
        };
        match failure {
            Some(error) => self.fail(&run, error).await,
            None => Ok(()),
        }
    }

    fn rework_proposal(&self, gate: &OpenGate, requested: &[(String, Option<String>)]) -> Proposal {
        let limit = self
            .pipeline
            .stage_index(&gate.stage)
            .unwrap_or(self.pipeline.stages.len().saturating_sub(1));
        match self.resolve_targets(requested, limit) {
            Ok(targets) => Proposal::Decide(GateDecision::Reworked { targets }),
            Err(reason) => Proposal::Ignore(reason),
        }
    }

    fn review_proposal(&self, gate: &OpenGate, reviews: &[StageReview]) -> Proposal {
        if reviews.is_empty() {
            return Proposal::Ignore("empty review".to_string());
        }
        if let Some(refused) = reviews.iter().find(|r| !r.accepted && !r.retry) {
            return Proposal::Decide(GateDecision::Rejected {
                reason: format!("stage '{}' was not accepted", refused.stage),
            });
        }
        let retries: Vec<(String, Option<String>)> = reviews
            .iter()
            .filter(|r| r.retry)
            .map(|r| (r.stage.clone(), r.instruction.clone()))
            .collect();
        if retries.is_empty() {
            Proposal::Decide(GateDecision::Approved)
        } else {
            self.rework_proposal(gate, &retries)
        }
    }

    /// Expand and validate rework targets. A parallel stage name expands to all
    /// of its branches. Targets must be at or before stage index `limit`.
    fn resolve_targets(
        &self,
        requested: &[(String, Option<String>)],
        limit: usize,
    ) -> Result<Vec<ReworkTarget>, String> {
        if requested.is_empty() {
            return Err("no stages named".to_string());
        }
        let mut targets: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (name, instruction) in requested {
            let stage = self.stage_of(name).map_err(|e| e.to_string())?;
            let index = self.pipeline.stage_index(&stage.name).unwrap_or(usize::MAX);
            if index > limit {
                return Err(format!("stage '{name}' has not run yet"));
            }
            let steps = if stage.is_parallel() && !name.contains(BRANCH_SEPARATOR) {
                stage.step_names()
            } else if stage.step_names().contains(name) {
                vec![name.clone()]
            } else {
                return Err(format!("'{name}' is not a step of this pipeline"));
            };
            for step in steps {
                targets.insert(step, instruction.clone());
            }
        }
        Ok(targets
            .into_iter()
            .map(|(step, instruction)| ReworkTarget { step, instruction })
            .collect())
    }

    /// Stage spec owning a step name (`stage` or `stage/branch`).
    fn stage_of(&self, step: &str) -> Result<&StageSpec, MachineError> {
        let base = step.split(BRANCH_SEPARATOR).next().unwrap_or(step);
        self.pipeline
            .stage(base)
            .ok_or_else(|| MachineError::UnknownStage(step.to_string()))
    }

    /// 1 + number of decisions already recorded for this stage's gate.
    async fn next_gate_iteration(&self, run_id: Uuid, stage: &str) -> Result<u32, MachineError> {
        let mut iteration = 1;
        while self
            .repo
            .get_gate_decision(&run_id, stage, iteration)
            .await
            .map_err(repo_err)?
            .is_some()
        {
            iteration += 1;
        }
        Ok(iteration)
    }

    // -----------------------------------------------------------------------
    // Terminal
    // -----------------------------------------------------------------------

    async fn drain_terminal(&self, run: &Run) -> Result<(), MachineError> {
        for record in self.pending(run).await? {
            match &record.signal {
                Signal::ResumeFrom { stage } => {
                    self.consume(run, &record).await?;
                    self.fork_on_signal(run, stage).await?;
                }
                _ => self.ignore(run, &record, "run is finished").await?,
            }
        }
        Ok(())
    }

    /// Fork on behalf of a signal. Problems with the request itself are logged, not raised.
    async fn fork_on_signal(&self, run: &Run, stage: &str) -> Result<(), MachineError> {
        match self.resume_from(run.id, stage).await {
            Ok(_) => Ok(()),
            Err(
                e @ (MachineError::UnknownStage(_)
                | MachineError::IncompleteHistory(_)
                | MachineError::InvalidState { .. }),
            ) => {
                tracing::warn!(run_id = %run.id, stage, error = %e, "resume_from signal not applied");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn update(
        &self,
        run: &Run,
        status: RunStatus,
        current_stage: Option<String>,
        gate: Option<OpenGate>,
        error: Option<RunError>,
    ) -> Result<(), MachineError> {
        tracing::debug!(
            run_id = %run.id,
            from = %run.status,
            to = %status,
            stage = ?current_stage,
            "run transition"
        );
        self.repo
            .update_run(
                &run.id,
                &RunUpdate {
                    status,
                    current_stage,
                    gate,
                    error,
                },
            )
            .await
            .map_err(repo_err)
    }

    async fn complete(&self, run: &Run) -> Result<(), MachineError> {
        self.update(run, RunStatus::Completed, None, None, None).await?;
        let duration_ms = Utc::now()
            .signed_duration_since(run.created_at)
            .num_milliseconds()
            .max(0) as u64;
        tracing::info!(run_id = %run.id, duration_ms, "run completed");
        self.events.publish(PipelineEvent::RunCompleted {
            run_id: run.id,
            duration_ms,
        });
        Ok(())
    }

    async fn fail(&self, run: &Run, error: RunError) -> Result<(), MachineError> {
        tracing::error!(
            run_id = %run.id,
            stage = ?error.stage,
            code = %error.code,
            attempts = error.attempts,
            message = %error.message,
            "run failed"
        );
        self.events.publish(PipelineEvent::RunFailed {
            run_id: run.id,
            code: error.code.clone(),
            error: error.message.clone(),
        });
        self.update(
            run,
            RunStatus::Failed,
            run.current_stage.clone(),
            None,
            Some(error),
        )
        .await
    }

    async fn cancel(&self, run: &Run) -> Result<(), MachineError> {
        self.update(run, RunStatus::Cancelled, run.current_stage.clone(), None, None)
            .await?;
        tracing::info!(run_id = %run.id, "run cancelled");
        self.events.publish(PipelineEvent::RunCancelled { run_id: run.id });
        Ok(())
    }

    async fn pause(&self, run: &Run) -> Result<(), MachineError> {
        self.update(run, RunStatus::Paused, run.current_stage.clone(), None, None)
            .await?;
        tracing::info!(run_id = %run.id, stage = ?run.current_stage, "run paused");
        self.events.publish(PipelineEvent::RunSuspended {
            run_id: run.id,
            status: RunStatus::Paused,
            stage: run.current_stage.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbox helpers
    // -----------------------------------------------------------------------

    async fn pending(&self, run: &Run) -> Result<Vec<SignalRecord>, MachineError> {
        self.repo.pending_signals(&run.id).await.map_err(repo_err)
    }

    async fn consume(&self, run: &Run, record: &SignalRecord) -> Result<(), MachineError> {
        self.repo
            .mark_signal_consumed(&run.id, record.seq)
            .await
            .map_err(repo_err)
    }

    async fn ignore(&self, run: &Run, record: &SignalRecord, reason: &str) -> Result<(), MachineError> {
        tracing::warn!(
            run_id = %run.id,
            seq = record.seq,
            signal = %record.signal,
            status = %run.status,
            reason,
            "signal ignored"
        );
        self.consume(run, record).await?;
        self.events.publish(PipelineEvent::SignalIgnored {
            run_id: run.id,
            signal: record.signal.kind().to_string(),
            status: run.status,
        });
        Ok(())
    }

    /// Consume decision signals that queued up behind the one just applied.
    async fn drain_gate_signals(&self, run: &Run) -> Result<(), MachineError> {
        for record in self.pending(run).await? {
            if matches!(
                record.signal,
                Signal::Approve
                    | Signal::Reject { .. }
                    | Signal::RejectWithInstructions { .. }
                    | Signal::StageReview { .. }
                    | Signal::RetryStage { .. }
            ) {
                self.ignore(run, &record, "gate already decided").await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    async fn load_run(&self, run_id: Uuid) -> Result<Run, MachineError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(repo_err)?
            .ok_or(MachineError::RunNotFound(run_id))
    }

    fn check_pipeline(&self, run: &Run) -> Result<(), MachineError> {
        if run.pipeline == self.pipeline.name {
            Ok(())
        } else {
            Err(MachineError::PipelineMismatch {
                run_id: run.id,
                expected: self.pipeline.name.clone(),
                actual: run.pipeline.clone(),
            })
        }
    }

    /// Latest artifact of every step of the stages before `index`, in pipeline order.
    async fn prior_artifacts(&self, run: &Run, index: usize) -> Result<Vec<Artifact>, MachineError> {
        let artifacts = self.repo.list_artifacts(&run.id).await.map_err(repo_err)?;
        let mut prior = Vec::new();
        for spec in &self.pipeline.stages[..index] {
            for name in spec.step_names() {
                if let Some(artifact) = latest_artifact(&artifacts, &name) {
                    prior.push(artifact.clone());
                }
            }
        }
        Ok(prior)
    }
}

fn latest_artifact<'a>(artifacts: &'a [Artifact], step_name: &str) -> Option<&'a Artifact> {
    artifacts
        .iter()
        .filter(|a| a.stage_name == step_name)
        .max_by_key(|a| a.created_at)
}

fn run_error(
    stage: &str,
    code: &str,
    classification: Option<FailureClass>,
    attempts: u32,
    message: &str,
) -> RunError {
    RunError {
        stage: Some(stage.to_string()),
        code: code.to_string(),
        classification,
        attempts,
        message: message.to_string(),
    }
}

fn failure_error(failure: &StepFailure) -> RunError {
    run_error(
        &failure.stage,
        &failure.error_code,
        Some(failure.classification),
        failure.attempts,
        &failure.message,
    )
}

/// Turn an executor error into the error the run fails with. Infrastructure
/// errors propagate instead; the run stays `running` and can be driven again.
fn stage_failure(error: ExecutorError) -> Result<RunError, MachineError> {
    match error {
        ExecutorError::StepFailed(failure) => Ok(failure_error(&failure)),
        ExecutorError::IdempotencyConflict { ref stage, .. } => Ok(run_error(
            stage,
            "idempotency_conflict",
            Some(FailureClass::NonRetryable),
            0,
            &error.to_string(),
        )),
        ExecutorError::UnknownStage(ref stage) => Ok(run_error(
            stage,
            "unknown_stage",
            Some(FailureClass::NonRetryable),
            0,
            &error.to_string(),
        )),
        other => Err(other.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
