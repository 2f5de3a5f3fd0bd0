//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over repository and object-store traits; AppState
//! pins it to per-tenant SQLite databases and a filesystem object store under
//! the data directory:
//!
//! ```text
//! {data_dir}/
//!   config.toml                     engine configuration
//!   pipelines/*.yaml                pipeline definitions
//!   prompts/{pipeline}/{stage}.toml stage bindings
//!   objects/                        artifact blobs and pointers
//!   tenants/{tenant}/cadence.db     run metadata
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use cadence_core::event::EventBus;
use cadence_core::pipeline::definition::{PipelineError, discover_pipelines};
use cadence_core::pipeline::machine::RunStateMachine;
use cadence_core::repository::pipeline::PipelineRepository;
use cadence_core::storage::cas::ContentAddressedStore;
use cadence_infra::config::{load_engine_config, resolve_data_dir};
use cadence_infra::sqlite::pipeline::SqlitePipelineRepository;
use cadence_infra::storage::filesystem::FsObjectStore;
use cadence_infra::tenant::TenantPoolRegistry;
use cadence_types::config::EngineConfig;
use cadence_types::pipeline::PipelineDefinition;
use cadence_types::run::{Run, TenantId};
use uuid::Uuid;

use crate::generator::{Generator, build_registry};

/// The engine pinned to the concrete infra implementations.
pub type Engine = RunStateMachine<SqlitePipelineRepository, FsObjectStore>;

/// Shared application state for CLI commands.
pub struct AppState {
    pub data_dir: PathBuf,
    pub tenant: TenantId,
    pub config: Arc<EngineConfig>,
    pub tenants: TenantPoolRegistry,
    pub cas: Arc<ContentAddressedStore<FsObjectStore>>,
    pub events: EventBus,
    pub generator: Generator,
}

impl AppState {
    /// Resolve the data directory, load configuration and open the object store.
    /// Tenant databases are opened lazily.
    pub async fn init(tenant: TenantId) -> Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = Arc::new(load_engine_config(&data_dir).await);
        let tenants = TenantPoolRegistry::new(&data_dir, &config.tenant_cache);
        let cas = Arc::new(ContentAddressedStore::new(FsObjectStore::new(
            data_dir.join("objects"),
        )));
        let events = EventBus::new(config.event_bus_capacity);
        let generator = Generator::from_env();

        tracing::debug!(
            data_dir = %data_dir.display(),
            tenant = %tenant,
            generator = %generator.describe(),
            "application state initialized"
        );

        Ok(Self {
            data_dir,
            tenant,
            config,
            tenants,
            cas,
            events,
            generator,
        })
    }

    pub fn pipelines_dir(&self) -> PathBuf {
        self.data_dir.join("pipelines")
    }

    /// All valid pipeline definitions in the pipelines directory.
    pub fn pipelines(&self) -> Result<Vec<PipelineDefinition>, PipelineError> {
        Ok(discover_pipelines(&self.pipelines_dir())?
            .into_iter()
            .map(|(_, def)| def)
            .collect())
    }

    pub fn find_pipeline(&self, name: &str) -> Result<PipelineDefinition> {
        self.pipelines()
            .context("Failed to read pipelines")?
            .into_iter()
            .find(|def| def.name == name)
            .ok_or_else(|| {
                anyhow!(
                    "Pipeline '{name}' not found in {}",
                    self.pipelines_dir().display()
                )
            })
    }

    /// Metadata repository of the current tenant.
    pub async fn repository(&self) -> Result<SqlitePipelineRepository> {
        let pool = self
            .tenants
            .pool(&self.tenant)
            .await
            .with_context(|| format!("Failed to open database for tenant '{}'", self.tenant))?;
        Ok(SqlitePipelineRepository::new(pool))
    }

    /// Engine for a pipeline of the current tenant.
    pub async fn engine(&self, pipeline: PipelineDefinition) -> Result<Engine> {
        let stages = build_registry(&self.data_dir, &pipeline, &self.generator).await?;
        Ok(RunStateMachine::new(
            Arc::new(self.repository().await?),
            self.cas.clone(),
            stages,
            Arc::new(pipeline),
            self.events.clone(),
            self.config.clone(),
        ))
    }

    /// Load a run and the engine for its pipeline.
    pub async fn engine_for_run(&self, run_id: Uuid) -> Result<(Engine, Run)> {
        let run = self.get_run(run_id).await?;
        let pipeline = self.find_pipeline(&run.pipeline)?;
        Ok((self.engine(pipeline).await?, run))
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.repository()
            .await?
            .get_run(&run_id)
            .await
            .map_err(|e| anyhow!("Failed to get run: {e}"))?
            .ok_or_else(|| anyhow!("Run '{run_id}' not found for tenant '{}'", self.tenant))
    }

    /// Close open tenant databases.
    pub fn shutdown(&self) {
        self.tenants.shutdown();
    }
}
