//! Job and batch order orchestration for the item relationship engine.
//!
//! [`Engine`] wires the collaborators, the optional edge store, and both
//! orchestrators together; the CLI (or any other host) drives it.

pub mod batch;
pub mod batch_orchestrator;
pub mod job;
pub mod orchestrator;

use std::sync::Arc;

use tracing::info;

use irs_registry::{Collaborators, JobStore, NoopJobStore};
use irs_shared::{AppConfig, EngineConfig, Result};
use irs_storage::EdgeStore;

pub use batch::{
    BatchJob, BatchOrderRequest, BatchOrderView, BatchRelease, BatchStrategy, BatchView,
    CallbackMode, OrderTimeoutPolicy, ProcessingState,
};
pub use batch_orchestrator::{BatchOrderOrchestrator, ProgressReporter, SilentProgress};
pub use job::{JobRequest, JobView};
pub use orchestrator::JobOrchestrator;

/// Process-wide engine: one job registry and one batch order registry.
#[derive(Clone)]
pub struct Engine {
    pub jobs: JobOrchestrator,
    pub orders: BatchOrderOrchestrator,
    retention: std::time::Duration,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators, store: Arc<dyn JobStore>) -> Self {
        let retention = config.terminal_job_retention;
        let jobs = JobOrchestrator::new(config, collaborators, store);
        Self {
            orders: BatchOrderOrchestrator::new(jobs.clone()),
            jobs,
            retention,
        }
    }

    /// Build an engine from the application config: collaborators per the
    /// client profile, and the edge store when a database path is set.
    pub async fn from_app_config(config: &AppConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config.clients)?;
        let store: Arc<dyn JobStore> = match &config.storage.known_subtree_db {
            Some(path) => {
                info!(path = %path.display(), "using edge store");
                Arc::new(EdgeStore::open(path).await?)
            }
            None => Arc::new(NoopJobStore),
        };
        Ok(Self::new(EngineConfig::from(config), collaborators, store))
    }

    /// Drop orders, then jobs, that finished longer ago than the retention.
    pub fn prune(&self) -> usize {
        self.orders.prune_terminal(self.retention) + self.jobs.prune_terminal(self.retention)
    }
}
