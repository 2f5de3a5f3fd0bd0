//! Stage bodies: the units of work a pipeline invokes.
//!
//! `Stage` uses RPITIT and cannot be a trait object, so the registry stores
//! stages behind the object-safe `StageDyn` companion trait:
//! 1. `StageDyn` mirrors `Stage` with boxed futures
//! 2. every `T: Stage` gets `StageDyn` through a blanket impl
//! 3. `BoxStage` wraps `Arc<dyn StageDyn>` so it can be cloned into branch tasks

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::artifact::{ArtifactRef, Digest};
use cadence_types::failure::StageError;
use cadence_types::run::TenantId;
use cadence_types::step::{BRANCH_SEPARATOR, branch_stage_name};
use serde_json::Value;
use uuid::Uuid;

use super::checkpoint::PhaseCheckpoints;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// An upstream artifact handed to a stage, with its verified bytes.
#[derive(Debug, Clone)]
pub struct PriorArtifact {
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
}

impl PriorArtifact {
    /// Bytes as UTF-8 text (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Everything a stage body may read. Stages are pure functions of this value.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub tenant: TenantId,
    pub run_id: Uuid,
    /// Stage name as declared in the pipeline.
    pub stage: String,
    /// Branch name when executing one branch of a parallel stage.
    pub branch: Option<String>,
    /// Immutable run configuration.
    pub config: Value,
    /// Artifacts of all earlier stages, in pipeline order.
    pub prior: Vec<PriorArtifact>,
    /// Correction instructions accumulated for this execution (human first,
    /// then quality-retry feedback).
    pub instructions: Vec<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub input_digest: Digest,
}

impl StageInput {
    /// Step name: `stage` or `stage/branch`.
    pub fn step_name(&self) -> String {
        match &self.branch {
            Some(branch) => branch_stage_name(&self.stage, branch),
            None => self.stage.clone(),
        }
    }

    /// Artifacts produced by a given earlier stage (all branches for a parallel stage).
    pub fn prior_from<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a PriorArtifact> + 'a {
        self.prior.iter().filter(move |p| {
            let name = p.artifact.stage_name.as_str();
            name == stage
                || name
                    .split_once(BRANCH_SEPARATOR)
                    .is_some_and(|(base, _)| base == stage)
        })
    }
}

/// What a successful stage returns. The engine stores `bytes` in the
/// content-addressed store; nothing else leaves the stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub artifact_type: String,
    pub bytes: Vec<u8>,
    pub metadata: Value,
    /// Per-attempt measurements (token usage, counts) recorded on the attempt.
    pub metrics: Value,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new(artifact_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            bytes: bytes.into(),
            metadata: Value::Null,
            metrics: Value::Null,
            warnings: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Engine services available to a running stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub attempt_id: Uuid,
    /// Phase checkpoints scoped to this step and input digest.
    pub checkpoints: PhaseCheckpoints,
}

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A stage body.
///
/// Implementations must be deterministic functions of `StageInput`; side
/// state lives only in phase checkpoints.
pub trait Stage: Send + Sync {
    fn run(
        &self,
        input: &StageInput,
        ctx: &StageContext,
    ) -> impl Future<Output = Result<StageOutput, StageError>> + Send;
}

/// Object-safe version of [`Stage`] with boxed futures.
pub trait StageDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        input: &'a StageInput,
        ctx: &'a StageContext,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutput, StageError>> + Send + 'a>>;
}

impl<T: Stage> StageDyn for T {
    fn run_boxed<'a>(
        &'a self,
        input: &'a StageInput,
        ctx: &'a StageContext,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutput, StageError>> + Send + 'a>> {
        Box::pin(self.run(input, ctx))
    }
}

/// Type-erased, cheaply cloneable stage.
#[derive(Clone)]
pub struct BoxStage {
    inner: Arc<dyn StageDyn>,
}

impl BoxStage {
    pub fn new<T: Stage + 'static>(stage: T) -> Self {
        Self {
            inner: Arc::new(stage),
        }
    }

    pub async fn run(
        &self,
        input: &StageInput,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        self.inner.run_boxed(input, ctx).await
    }
}

impl std::fmt::Debug for BoxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStage")
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Stage bodies by name.
///
/// A branch of a parallel stage resolves to a body registered under
/// `stage/branch` if present, otherwise to the one registered under `stage`.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, BoxStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Stage + 'static>(&mut self, name: impl Into<String>, stage: T) -> &mut Self {
        self.stages.insert(name.into(), BoxStage::new(stage));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, stage: BoxStage) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn resolve(&self, stage: &str, branch: Option<&str>) -> Option<BoxStage> {
        branch
            .and_then(|b| self.stages.get(&branch_stage_name(stage, b)))
            .or_else(|| self.stages.get(stage))
            .cloned()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
