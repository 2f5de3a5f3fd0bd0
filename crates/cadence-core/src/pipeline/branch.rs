//! Fan-out of a parallel stage into its named branches.
//!
//! Each branch is its own step (`stage/branch`) with its own attempts, retry
//! budget and artifact. Branches run concurrently on a `JoinSet`, bounded by a
//! semaphore; a failing branch never cancels or fails its siblings. The
//! coordinator reports per-branch outcomes and lets the state machine decide
//! what a partial failure means for the run.

use std::sync::Arc;

use cadence_types::artifact::{Artifact, ArtifactRef};
use cadence_types::pipeline::StageSpec;
use cadence_types::run::Run;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::repository::pipeline::PipelineRepository;
use crate::storage::object_store::ObjectStore;

use super::executor::{ExecutorError, StepExecutor, StepFailure, step_name};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Completed(ArtifactRef),
    Failed(StepFailure),
}

#[derive(Debug, Clone)]
pub struct BranchResult {
    pub branch: String,
    pub step_name: String,
    pub outcome: BranchOutcome,
    /// Attempts recorded on the branch step so far.
    pub attempts: u32,
}

/// Per-branch results of one fan-out, in declaration order.
#[derive(Debug, Clone)]
pub struct BranchReport {
    pub stage: String,
    pub branches: Vec<BranchResult>,
}

impl BranchReport {
    pub fn all_completed(&self) -> bool {
        self.branches
            .iter()
            .all(|b| matches!(b.outcome, BranchOutcome::Completed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&BranchResult, &StepFailure)> {
        self.branches.iter().filter_map(|b| match &b.outcome {
            BranchOutcome::Failed(failure) => Some((b, failure)),
            BranchOutcome::Completed(_) => None,
        })
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.branches.iter().filter_map(|b| match &b.outcome {
            BranchOutcome::Completed(artifact) => Some(artifact),
            BranchOutcome::Failed(_) => None,
        })
    }

    pub fn get(&self, branch: &str) -> Option<&BranchResult> {
        self.branches.iter().find(|b| b.branch == branch)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("stage '{stage}' has no branch '{branch}'")]
    UnknownBranch { stage: String, branch: String },

    #[error("branch '{stage}/{branch}' already used {retries} retries")]
    RetryCapExceeded {
        stage: String,
        branch: String,
        retries: u32,
    },

    #[error("branch '{branch}': {source}")]
    Executor {
        branch: String,
        #[source]
        source: ExecutorError,
    },

    #[error("branch task failed: {0}")]
    Join(String),

    #[error("repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ParallelBranchCoordinator<R: PipelineRepository + 'static, S: ObjectStore + 'static> {
    executor: Arc<StepExecutor<R, S>>,
    repo: Arc<R>,
}

impl<R: PipelineRepository + 'static, S: ObjectStore + 'static> ParallelBranchCoordinator<R, S> {
    pub fn new(executor: Arc<StepExecutor<R, S>>, repo: Arc<R>) -> Self {
        Self { executor, repo }
    }

    /// Run every branch of a parallel stage and wait for all of them.
    pub async fn run_stage(
        &self,
        run: &Run,
        stage: &StageSpec,
        prior: &[Artifact],
    ) -> Result<BranchReport, BranchError> {
        self.run_branches(run, stage, prior, stage.branches.clone())
            .await
    }

    /// Re-invoke only `subset` (branch, optional instruction); siblings are
    /// left untouched. Every cap is checked before any branch is revised.
    pub async fn retry_branches(
        &self,
        run: &Run,
        stage: &StageSpec,
        prior: &[Artifact],
        subset: &[(String, Option<String>)],
    ) -> Result<BranchReport, BranchError> {
        self.revise_branches(run, stage, subset).await?;
        let branches = subset.iter().map(|(b, _)| b.clone()).collect();
        self.run_branches(run, stage, prior, branches).await
    }

    /// Re-arm `subset` for its next execution without running it.
    pub async fn revise_branches(
        &self,
        run: &Run,
        stage: &StageSpec,
        subset: &[(String, Option<String>)],
    ) -> Result<(), BranchError> {
        self.check_retry_caps(run, stage, subset).await?;
        for (branch, instruction) in subset {
            self.executor
                .revise_step(run.id, &step_name(stage, Some(branch)), instruction.as_deref())
                .await
                .map_err(|source| BranchError::Executor {
                    branch: branch.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Fails on the first branch of `subset` that is unknown or has no retry left.
    pub async fn check_retry_caps(
        &self,
        run: &Run,
        stage: &StageSpec,
        subset: &[(String, Option<String>)],
    ) -> Result<(), BranchError> {
        for (branch, _) in subset {
            if !stage.branches.contains(branch) {
                return Err(BranchError::UnknownBranch {
                    stage: stage.name.clone(),
                    branch: branch.clone(),
                });
            }
        }

        for (branch, _) in subset {
            let exhausted = self
                .executor
                .retries_exhausted(run.id, stage, &step_name(stage, Some(branch)))
                .await
                .map_err(|source| BranchError::Executor {
                    branch: branch.clone(),
                    source,
                })?;
            if let Some(retries) = exhausted {
                return Err(BranchError::RetryCapExceeded {
                    stage: stage.name.clone(),
                    branch: branch.clone(),
                    retries,
                });
            }
        }
        Ok(())
    }

    async fn run_branches(
        &self,
        run: &Run,
        stage: &StageSpec,
        prior: &[Artifact],
        branches: Vec<String>,
    ) -> Result<BranchReport, BranchError> {
        let limit = self
            .executor
            .config()
            .max_parallel_branches
            .clamp(1, branches.len().max(1));
        let semaphore = Arc::new(Semaphore::new(limit));
        let run_arc = Arc::new(run.clone());
        let stage_arc = Arc::new(stage.clone());
        let prior_arc: Arc<Vec<Artifact>> = Arc::new(prior.to_vec());

        tracing::info!(
            run_id = %run.id,
            stage = %stage.name,
            branches = branches.len(),
            concurrency = limit,
            "fanning out branches"
        );

        let mut set = JoinSet::new();
        for (index, branch) in branches.into_iter().enumerate() {
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let run = run_arc.clone();
            let stage = stage_arc.clone();
            let prior = prior_arc.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = executor.execute(&run, &stage, Some(&branch), &prior).await;
                (index, branch, result)
            });
        }

        // Drain every task before reporting, so no branch is left running.
        let mut finished = Vec::new();
        let mut first_error: Option<BranchError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, branch, Ok(artifact))) => {
                    finished.push((index, branch, BranchOutcome::Completed(artifact)));
                }
                Ok((index, branch, Err(ExecutorError::StepFailed(failure)))) => {
                    tracing::warn!(
                        run_id = %run.id,
                        stage = %stage.name,
                        branch = %branch,
                        code = %failure.error_code,
                        "branch failed"
                    );
                    finished.push((index, branch, BranchOutcome::Failed(failure)));
                }
                Ok((_, branch, Err(source))) => {
                    tracing::error!(
                        run_id = %run.id,
                        stage = %stage.name,
                        branch = %branch,
                        error = %source,
                        "branch aborted"
                    );
                    first_error.get_or_insert(BranchError::Executor { branch, source });
                }
                Err(e) => {
                    tracing::error!(run_id = %run.id, stage = %stage.name, error = %e, "branch task panicked");
                    first_error.get_or_insert(BranchError::Join(e.to_string()));
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        finished.sort_by_key(|(index, _, _)| *index);
        let mut results = Vec::with_capacity(finished.len());
        for (_, branch, outcome) in finished {
            let name = step_name(stage, Some(&branch));
            let attempts = match self
                .repo
                .get_step(&run.id, &name)
                .await
                .map_err(|e| BranchError::Repository(e.to_string()))?
            {
                Some(step) => self
                    .repo
                    .list_attempts(&step.id)
                    .await
                    .map_err(|e| BranchError::Repository(e.to_string()))?
                    .len() as u32,
                None => 0,
            };
            results.push(BranchResult {
                branch,
                step_name: name,
                outcome,
                attempts,
            });
        }

        Ok(BranchReport {
            stage: stage.name.clone(),
            branches: results,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::pipeline::stage::{Stage, StageContext, StageInput, StageOutput, StageRegistry};
    use crate::pipeline::testing::{Harness, ScriptedStage, fast_config, rate_limited};
    use cadence_types::failure::StageError;
    use cadence_types::run::TenantId;
    use cadence_types::step::StepStatus;
    use serde_json::json;

    fn run() -> Run {
        Run::new(TenantId::new("acme"), "article", json!({}))
    }

    fn analysis() -> StageSpec {
        StageSpec::parallel("analysis", &["a", "b", "c"])
    }

    fn coordinator(
        h: &Harness,
        registry: StageRegistry,
    ) -> ParallelBranchCoordinator<
        crate::repository::memory::InMemoryPipelineRepository,
        crate::storage::memory::InMemoryObjectStore,
    > {
        ParallelBranchCoordinator::new(h.executor(registry), h.repo.clone())
    }

    #[tokio::test]
    async fn all_branches_complete() {
        let h = Harness::new(fast_config());
        let mut registry = StageRegistry::new();
        registry.register("analysis", ScriptedStage::new("insight"));
        let coord = coordinator(&h, registry);
        let run = run();

        let report = coord.run_stage(&run, &analysis(), &[]).await.unwrap();
        assert!(report.all_completed());
        assert_eq!(
            report.branches.iter().map(|b| b.branch.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(report.branches.iter().all(|b| b.attempts == 1));
        assert_eq!(report.artifacts().count(), 3);
        assert_eq!(report.get("b").unwrap().step_name, "analysis/b");
    }

    #[tokio::test]
    async fn failing_branch_does_not_affect_siblings() {
        let h = Harness::new(fast_config());
        let mut registry = StageRegistry::new();
        registry
            .register("analysis", ScriptedStage::new("insight"))
            .register(
                "analysis/b",
                ScriptedStage::new("x").fail_always(StageError::Configuration("no model".into())),
            );
        let coord = coordinator(&h, registry);
        let run = run();

        let report = coord.run_stage(&run, &analysis(), &[]).await.unwrap();
        assert!(!report.all_completed());
        let failures: Vec<_> = report.failures().map(|(b, _)| b.branch.clone()).collect();
        assert_eq!(failures, vec!["b"]);
        for sibling in ["analysis/a", "analysis/c"] {
            let step = h.repo.get_step(&run.id, sibling).await.unwrap().unwrap();
            assert_eq!(step.status, StepStatus::Completed);
        }
    }

    #[tokio::test]
    async fn retried_branch_counts_its_own_attempts() {
        let h = Harness::new(fast_config());
        let mut registry = StageRegistry::new();
        registry
            .register("analysis", ScriptedStage::new("insight"))
            .register(
                "analysis/a",
                ScriptedStage::new("a")
                    .fail_next(rate_limited())
                    .fail_next(rate_limited()),
            );
        let coord = coordinator(&h, registry);

        let report = coord.run_stage(&run(), &analysis(), &[]).await.unwrap();
        assert!(report.all_completed());
        assert_eq!(report.get("a").unwrap().attempts, 3);
        assert_eq!(report.get("b").unwrap().attempts, 1);
        assert_eq!(report.get("c").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn selective_retry_leaves_siblings_untouched() {
        let h = Harness::new(fast_config());
        let a = ScriptedStage::new("a");
        let others = ScriptedStage::new("other");
        let mut registry = StageRegistry::new();
        registry
            .register("analysis", others.clone())
            .register("analysis/a", a.clone());
        let coord = coordinator(&h, registry);
        let run = run();

        let before = coord.run_stage(&run, &analysis(), &[]).await.unwrap();
        let report = coord
            .retry_branches(
                &run,
                &analysis(),
                &[],
                &[("a".to_string(), Some("more numbers".to_string()))],
            )
            .await
            .unwrap();

        assert_eq!(report.branches.len(), 1);
        assert_eq!(a.calls(), 2);
        assert_eq!(others.calls(), 2);
        assert_eq!(a.inputs()[1].instructions, vec!["more numbers".to_string()]);
        let step = h.repo.get_step(&run.id, "analysis/b").await.unwrap().unwrap();
        assert_eq!(step.revision, 0);
        assert_eq!(h.repo.list_attempts(&step.id).await.unwrap().len(), 1);

        let old_a = before.get("a").unwrap();
        let new_a = report.get("a").unwrap();
        assert_ne!(old_a.outcome, new_a.outcome);
    }

    #[tokio::test]
    async fn retry_over_cap_is_refused_before_any_revision() {
        let h = Harness::new(fast_config());
        let mut registry = StageRegistry::new();
        registry.register("analysis", ScriptedStage::new("insight"));
        let coord = coordinator(&h, registry);
        let run = run();
        let stage = StageSpec {
            max_retries: Some(1),
            ..analysis()
        };

        coord.run_stage(&run, &stage, &[]).await.unwrap();
        let subset = vec![("a".to_string(), None), ("b".to_string(), None)];
        coord.retry_branches(&run, &stage, &[], &subset[..1]).await.unwrap();

        let err = coord.retry_branches(&run, &stage, &[], &subset).await.unwrap_err();
        assert!(matches!(err, BranchError::RetryCapExceeded { ref branch, retries: 1, .. } if branch == "a"));
        let b = h.repo.get_step(&run.id, "analysis/b").await.unwrap().unwrap();
        assert_eq!(b.revision, 0);
    }

    #[tokio::test]
    async fn unknown_branch_is_rejected() {
        let h = Harness::new(fast_config());
        let coord = coordinator(&h, StageRegistry::new());
        let err = coord
            .retry_branches(&run(), &analysis(), &[], &[("z".to_string(), None)])
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::UnknownBranch { .. }));
    }

    #[derive(Clone, Default)]
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Stage for Gauge {
        async fn run(&self, _input: &StageInput, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(StageOutput::new("text", "g"))
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let mut config = fast_config();
        config.max_parallel_branches = 2;
        let h = Harness::new(config);
        let gauge = Gauge::default();
        let mut registry = StageRegistry::new();
        registry.register("fan", gauge.clone());
        let coord = coordinator(&h, registry);

        let stage = StageSpec::parallel("fan", &["p", "q", "r", "s", "t"]);
        let report = coord.run_stage(&run(), &stage, &[]).await.unwrap();
        assert!(report.all_completed());
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }
}
