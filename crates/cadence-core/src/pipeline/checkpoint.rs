//! Durable intra-step phase checkpoints.
//!
//! Wraps `PipelineRepository` to snapshot the named phases of an expensive
//! multi-call stage, keyed by `(run, step, phase)`. Every snapshot records the
//! input digest that produced it; `load` returns nothing when the caller's
//! digest differs, so a stage never resumes from intermediate state computed
//! against stale upstream inputs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::artifact::Digest;
use cadence_types::checkpoint::Checkpoint;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::pipeline::PipelineRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages phase checkpoints for steps.
///
/// Generic over `R: PipelineRepository` so it works with any storage backend.
pub struct CheckpointManager<R: PipelineRepository> {
    repo: Arc<R>,
}

impl<R: PipelineRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Save (or overwrite) one phase snapshot.
    pub async fn save(
        &self,
        run_id: Uuid,
        stage_name: &str,
        phase: &str,
        data: &Value,
        input_digest: &Digest,
    ) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint {
            run_id,
            stage_name: stage_name.to_string(),
            phase: phase.to_string(),
            data: data.clone(),
            input_digest: input_digest.clone(),
            saved_at: Utc::now(),
        };

        self.repo
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            stage = stage_name,
            phase,
            "checkpointed phase"
        );
        Ok(())
    }

    /// Load a phase snapshot, or `None` if absent or produced by different inputs.
    pub async fn load(
        &self,
        run_id: Uuid,
        stage_name: &str,
        phase: &str,
        expected_digest: &Digest,
    ) -> Result<Option<Value>, CheckpointError> {
        let stored = self
            .repo
            .get_checkpoint(&run_id, stage_name, phase)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        match stored {
            Some(cp) if &cp.input_digest == expected_digest => Ok(Some(cp.data)),
            Some(cp) => {
                tracing::debug!(
                    run_id = %run_id,
                    stage = stage_name,
                    phase,
                    stored = cp.input_digest.short(),
                    expected = expected_digest.short(),
                    "ignoring stale checkpoint"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drop every phase snapshot of a step.
    pub async fn clear(&self, run_id: Uuid, stage_name: &str) -> Result<u64, CheckpointError> {
        let removed = self
            .repo
            .delete_checkpoints(&run_id, stage_name)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        if removed > 0 {
            tracing::debug!(run_id = %run_id, stage = stage_name, removed, "cleared checkpoints");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Object-safe phase store
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe view of a `CheckpointManager`, so stage bodies can use
/// checkpoints without being generic over the repository.
pub trait PhaseStore: Send + Sync {
    fn save_boxed<'a>(
        &'a self,
        run_id: Uuid,
        stage_name: &'a str,
        phase: &'a str,
        data: &'a Value,
        input_digest: &'a Digest,
    ) -> BoxFuture<'a, Result<(), CheckpointError>>;

    fn load_boxed<'a>(
        &'a self,
        run_id: Uuid,
        stage_name: &'a str,
        phase: &'a str,
        expected_digest: &'a Digest,
    ) -> BoxFuture<'a, Result<Option<Value>, CheckpointError>>;
}

impl<R: PipelineRepository> PhaseStore for CheckpointManager<R> {
    fn save_boxed<'a>(
        &'a self,
        run_id: Uuid,
        stage_name: &'a str,
        phase: &'a str,
        data: &'a Value,
        input_digest: &'a Digest,
    ) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(self.save(run_id, stage_name, phase, data, input_digest))
    }

    fn load_boxed<'a>(
        &'a self,
        run_id: Uuid,
        stage_name: &'a str,
        phase: &'a str,
        expected_digest: &'a Digest,
    ) -> BoxFuture<'a, Result<Option<Value>, CheckpointError>> {
        Box::pin(self.load(run_id, stage_name, phase, expected_digest))
    }
}

// ---------------------------------------------------------------------------
// PhaseCheckpoints
// ---------------------------------------------------------------------------

/// Checkpoint handle bound to one step execution `(run, step, input_digest)`.
#[derive(Clone)]
pub struct PhaseCheckpoints {
    store: Arc<dyn PhaseStore>,
    run_id: Uuid,
    stage_name: String,
    input_digest: Digest,
}

impl PhaseCheckpoints {
    pub fn new(
        store: Arc<dyn PhaseStore>,
        run_id: Uuid,
        stage_name: impl Into<String>,
        input_digest: Digest,
    ) -> Self {
        Self {
            store,
            run_id,
            stage_name: stage_name.into(),
            input_digest,
        }
    }

    pub fn input_digest(&self) -> &Digest {
        &self.input_digest
    }

    pub async fn save(&self, phase: &str, data: &Value) -> Result<(), CheckpointError> {
        self.store
            .save_boxed(self.run_id, &self.stage_name, phase, data, &self.input_digest)
            .await
    }

    pub async fn load(&self, phase: &str) -> Result<Option<Value>, CheckpointError> {
        self.store
            .load_boxed(self.run_id, &self.stage_name, phase, &self.input_digest)
            .await
    }

    /// Typed save.
    pub async fn save_as<T: Serialize>(&self, phase: &str, data: &T) -> Result<(), CheckpointError> {
        let value = serde_json::to_value(data)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        self.save(phase, &value).await
    }

    /// Typed load. A snapshot that no longer deserializes is treated as absent.
    pub async fn load_as<T: DeserializeOwned>(&self, phase: &str) -> Result<Option<T>, CheckpointError> {
        Ok(self
            .load(phase)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }
}

impl std::fmt::Debug for PhaseCheckpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseCheckpoints")
            .field("run_id", &self.run_id)
            .field("stage_name", &self.stage_name)
            .field("input_digest", &self.input_digest.short())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::content_digest;
    use crate::repository::memory::InMemoryPipelineRepository;
    use serde_json::json;

    fn manager() -> Arc<CheckpointManager<InMemoryPipelineRepository>> {
        Arc::new(CheckpointManager::new(Arc::new(InMemoryPipelineRepository::new())))
    }

    #[tokio::test]
    async fn load_with_matching_digest_returns_data() {
        let mgr = manager();
        let run = Uuid::now_v7();
        let d1 = content_digest(b"inputs v1");

        mgr.save(run, "research", "collect", &json!({"urls": 3}), &d1)
            .await
            .unwrap();
        let data = mgr.load(run, "research", "collect", &d1).await.unwrap();
        assert_eq!(data, Some(json!({"urls": 3})));
    }

    #[tokio::test]
    async fn load_with_different_digest_returns_none() {
        let mgr = manager();
        let run = Uuid::now_v7();
        let d1 = content_digest(b"inputs v1");
        let d2 = content_digest(b"inputs v2");

        mgr.save(run, "research", "collect", &json!({"urls": 3}), &d1)
            .await
            .unwrap();
        assert_eq!(mgr.load(run, "research", "collect", &d2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_overwrites_same_phase() {
        let mgr = manager();
        let run = Uuid::now_v7();
        let d1 = content_digest(b"v1");
        let d2 = content_digest(b"v2");

        mgr.save(run, "research", "collect", &json!(1), &d1).await.unwrap();
        mgr.save(run, "research", "collect", &json!(2), &d2).await.unwrap();
        assert_eq!(mgr.load(run, "research", "collect", &d1).await.unwrap(), None);
        assert_eq!(
            mgr.load(run, "research", "collect", &d2).await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn clear_removes_all_phases_of_step() {
        let mgr = manager();
        let run = Uuid::now_v7();
        let d = content_digest(b"v");
        mgr.save(run, "research", "collect", &json!(1), &d).await.unwrap();
        mgr.save(run, "research", "rank", &json!(2), &d).await.unwrap();
        mgr.save(run, "draft", "outline", &json!(3), &d).await.unwrap();

        assert_eq!(mgr.clear(run, "research").await.unwrap(), 2);
        assert_eq!(mgr.load(run, "research", "rank", &d).await.unwrap(), None);
        assert!(mgr.load(run, "draft", "outline", &d).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn phase_handle_is_bound_to_digest() {
        let mgr = manager();
        let run = Uuid::now_v7();
        let store: Arc<dyn PhaseStore> = mgr.clone();

        let v1 = PhaseCheckpoints::new(store.clone(), run, "research", content_digest(b"v1"));
        v1.save_as("collect", &vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let loaded: Option<Vec<String>> = v1.load_as("collect").await.unwrap();
        assert_eq!(loaded.unwrap().len(), 2);

        let v2 = PhaseCheckpoints::new(store, run, "research", content_digest(b"v2"));
        let loaded: Option<Vec<String>> = v2.load_as("collect").await.unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));
    }
}
