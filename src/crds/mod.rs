//! Custom Resource Definitions for the orchestrator

pub mod runner;
pub mod taskrun;

pub use runner::{Runner, RunnerSpec, RunnerState, RunnerStatus};
pub use taskrun::{TaskDocument, TaskRun, TaskRunSpec, TaskRunState, TaskRunStatus};
