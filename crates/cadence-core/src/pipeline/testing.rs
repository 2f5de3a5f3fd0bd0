//! Shared fixtures for engine tests: a scriptable stage and an in-memory harness.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cadence_types::config::{BackoffConfig, EngineConfig};
use cadence_types::failure::StageError;

use crate::event::EventBus;
use crate::repository::memory::InMemoryPipelineRepository;
use crate::storage::cas::ContentAddressedStore;
use crate::storage::memory::InMemoryObjectStore;

use super::checkpoint::CheckpointManager;
use super::executor::StepExecutor;
use super::stage::{Stage, StageContext, StageInput, StageOutput, StageRegistry};

pub type MemExecutor = StepExecutor<InMemoryPipelineRepository, InMemoryObjectStore>;

#[derive(Default)]
struct ScriptState {
    queued: VecDeque<StageError>,
    always_fail: Option<StageError>,
    inputs: Vec<StageInput>,
}

/// Stage that fails with queued errors, then succeeds with `text` plus any
/// instructions it was given. Clones share their script and call log.
#[derive(Clone)]
pub struct ScriptedStage {
    text: String,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedStage {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn fail_next(self, error: StageError) -> Self {
        self.state.lock().unwrap().queued.push_back(error);
        self
    }

    pub fn fail_always(self, error: StageError) -> Self {
        self.state.lock().unwrap().always_fail = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().inputs.len()
    }

    pub fn inputs(&self) -> Vec<StageInput> {
        self.state.lock().unwrap().inputs.clone()
    }
}

impl Stage for ScriptedStage {
    async fn run(&self, input: &StageInput, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.inputs.push(input.clone());
            state
                .queued
                .pop_front()
                .or_else(|| state.always_fail.clone())
        };
        if let Some(error) = next {
            return Err(error);
        }
        let mut text = self.text.clone();
        for instruction in &input.instructions {
            text.push_str(" | ");
            text.push_str(instruction);
        }
        Ok(StageOutput::new("text", text.into_bytes()))
    }
}

/// Engine config with millisecond backoff.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffConfig {
            initial_ms: 1,
            multiplier: 2,
            max_ms: 5,
        },
        ..EngineConfig::default()
    }
}

pub fn rate_limited() -> StageError {
    StageError::RateLimited {
        retry_after_ms: None,
    }
}

/// In-memory stores wired the way the engine expects.
pub struct Harness {
    pub repo: Arc<InMemoryPipelineRepository>,
    pub cas: Arc<ContentAddressedStore<InMemoryObjectStore>>,
    pub events: EventBus,
    pub config: Arc<EngineConfig>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            repo: Arc::new(InMemoryPipelineRepository::new()),
            cas: Arc::new(ContentAddressedStore::new(InMemoryObjectStore::new())),
            events: EventBus::new(256),
            config: Arc::new(config),
        }
    }

    pub fn executor(&self, registry: StageRegistry) -> Arc<MemExecutor> {
        Arc::new(StepExecutor::new(
            self.repo.clone(),
            self.cas.clone(),
            Arc::new(CheckpointManager::new(self.repo.clone())),
            Arc::new(registry),
            self.events.clone(),
            self.config.clone(),
        ))
    }
}
