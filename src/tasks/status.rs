//! Read-only status aggregation for the API surface.
//!
//! Snapshots are assembled from the entity stores the reconcilers write
//! to; the aggregator never talks to the workload substrate, so a read
//! reflects the last persisted transition, not the live pod state.

use crate::crds::{RunnerState, TaskRunState};
use crate::state::{RunnerStore, TaskRunStore};
use crate::tasks::config::ControllerConfig;
use serde::Serialize;

/// Externally visible view of one TaskRun
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSnapshot {
    pub task_id: u32,
    pub service: String,
    pub agent_id: String,
    pub state: TaskRunState,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,
}

/// Externally visible health of one pool group
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub pool_group: String,
    pub desired: u32,
    pub active: u32,
    pub registered: u32,
    pub busy: u32,
    pub provisioning: u32,
    pub terminating: u32,
    pub offline: u32,
}

impl PoolHealth {
    /// Healthy means the active count meets the desired count
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.active >= self.desired
    }
}

/// Look up one TaskRun by service and task id
#[must_use]
pub fn get_task_run(store: &TaskRunStore, service: &str, task_id: u32) -> Option<TaskRunSnapshot> {
    let key = crate::crds::taskrun::task_run_key(service, task_id);
    let run = store.get(&key)?;
    let status = run.status.clone().unwrap_or_default();

    Some(TaskRunSnapshot {
        task_id: run.spec.task_id,
        service: run.spec.service.clone(),
        agent_id: run.spec.agent_id.clone(),
        state: status.state,
        attempt_count: status.attempt_count,
        workload_ref: status.workload_ref,
        reason: status.reason,
        message: status.message,
        created_at: status.created_at,
        last_transition_at: status.last_transition_at,
    })
}

/// Aggregate health of a pool group; `None` for unmanaged groups
#[must_use]
pub fn get_pool_health(
    runners: &RunnerStore,
    config: &ControllerConfig,
    pool_group: &str,
) -> Option<PoolHealth> {
    let desired = config.desired_runners(pool_group)?;

    let mut health = PoolHealth {
        pool_group: pool_group.to_string(),
        desired,
        active: 0,
        registered: 0,
        busy: 0,
        provisioning: 0,
        terminating: 0,
        offline: 0,
    };

    for runner in runners.list_group(pool_group) {
        let state = runner.state();
        if state.is_active() {
            health.active += 1;
        }
        match state {
            RunnerState::Provisioning => health.provisioning += 1,
            RunnerState::Registered => health.registered += 1,
            RunnerState::Busy => health.busy += 1,
            RunnerState::Terminating => health.terminating += 1,
            RunnerState::Offline => health.offline += 1,
        }
    }

    Some(health)
}
