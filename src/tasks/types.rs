use super::config::ControllerConfig;
use super::registration::RegistrationClient;
use crate::state::{RunnerStore, StoreError, TaskRunStore};
use crate::workloads::{WorkloadError, WorkloadLauncher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

// Error type for the controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task configuration error: {0}")]
    ConfigError(String),

    #[error("Workload error: {0}")]
    WorkloadError(#[from] WorkloadError),

    #[error("State store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Invalid runner transition: {0}")]
    InvalidTransition(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the entity changes again
    AwaitChange,
    /// Re-enqueue after the given delay
    Requeue(Duration),
}

impl Action {
    #[must_use]
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    #[must_use]
    pub fn requeue(delay: Duration) -> Self {
        Action::Requeue(delay)
    }
}

// Context shared across controller operations
#[derive(Clone)]
pub struct Context {
    pub task_runs: Arc<TaskRunStore>,
    pub runners: Arc<RunnerStore>,
    pub launcher: Arc<dyn WorkloadLauncher>,
    pub registration: Arc<dyn RegistrationClient>,
    pub config: Arc<ControllerConfig>,
    /// Reconciliation queue; the gateway enqueues admitted runs here
    pub queue: UnboundedSender<String>,
}
