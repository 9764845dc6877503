//! Workload substrate abstraction.
//!
//! A workload is the isolated execution unit created for a TaskRun (an
//! init phase that prepares the workspace, then a main phase that runs
//! the agent) or for a pool runner (main phase only). The production
//! launcher in [`k8s`] maps workloads onto Kubernetes Jobs; tests drive
//! the reconcilers with fakes.

use crate::crds::taskrun::SecretEnvVar;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod k8s;

pub use k8s::JobLauncher;

/// Classified init-phase failure, surfaced by the workspace preparer
/// through its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepFailure {
    /// Credential resolution or remote authentication failed (permanent)
    AuthRejected,
    /// Definitive not-found response for the repository (permanent)
    RepoNotFound,
    /// Timeout or connection failure (retryable)
    NetworkError,
}

impl PrepFailure {
    /// Classified failures are permanent; transient ones go through the
    /// bounded retry policy
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, PrepFailure::NetworkError)
    }

    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            PrepFailure::AuthRejected => "AuthRejected",
            PrepFailure::RepoNotFound => "RepoNotFound",
            PrepFailure::NetworkError => "NetworkError",
        }
    }
}

/// Observed phase of a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Accepted by the substrate but no pod scheduled yet
    Scheduling,
    /// Init phase (workspace preparation) in progress
    Initializing,
    /// Init phase completed, agent process executing
    Running,
    /// Agent exited with code 0
    Succeeded,
    /// Agent exited nonzero
    Failed { exit_code: i32 },
    /// Init phase failed with a classified or transient preparation error
    InitFailed { failure: PrepFailure },
    /// The workload disappeared unexpectedly
    Gone,
}

/// Errors from the workload substrate
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// A workload with this name is already bound; the caller treats it
    /// as the one it meant to create (idempotent creation)
    #[error("workload already exists: {0}")]
    AlreadyExists(String),

    /// Scheduling failure, retryable
    #[error("workload scheduling failed: {0}")]
    Scheduling(String),

    /// Substrate API failure
    #[error("workload API error: {0}")]
    Api(String),
}

impl WorkloadError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkloadError::Scheduling(_) | WorkloadError::Api(_))
    }
}

/// One container within a workload phase
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_from_secrets: Vec<SecretEnvVar>,
}

/// Declarative description of a two-phase workload
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Deterministic workload name; creating the same spec twice binds
    /// the same workload
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Init phase (workspace preparation); absent for runner workloads
    pub init: Option<ContainerSpec>,
    /// Main phase (agent or runner process)
    pub main: ContainerSpec,
    pub active_deadline_seconds: i64,
}

/// Interface to the excluded orchestration substrate
#[async_trait]
pub trait WorkloadLauncher: Send + Sync {
    /// Create the workload and return its reference. Deterministic
    /// naming makes creation idempotent: an existing workload of the
    /// same name surfaces as [`WorkloadError::AlreadyExists`].
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, WorkloadError>;

    /// Observe the current phase of a previously created workload
    async fn status(&self, workload_ref: &str) -> Result<WorkloadPhase, WorkloadError>;

    /// Request cooperative termination; completion is not awaited
    async fn terminate(&self, workload_ref: &str) -> Result<(), WorkloadError>;
}
