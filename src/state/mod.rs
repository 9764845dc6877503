//! In-memory versioned entity stores for TaskRun and Runner records.
//!
//! Writes are serialized per entity through optimistic versioning: every
//! mutation must present the resource version it read, and a mismatch is
//! rejected with [`StoreError::Conflict`]. Two concurrent reconciliations
//! of the same entity therefore never both apply; the loser re-reads on
//! its next pass.

use crate::crds::{Runner, RunnerStatus, TaskRun, TaskRunStatus};
use dashmap::DashMap;
use kube::core::ObjectMeta;
use thiserror::Error;

/// Errors from the entity stores
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource version conflict for {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },

    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("an active entry already exists: {0}")]
    DuplicateActive(String),
}

fn version_of(meta: &ObjectMeta) -> u64 {
    meta.resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn bump_version(meta: &mut ObjectMeta) {
    let next = version_of(meta) + 1;
    meta.resource_version = Some(next.to_string());
}

/// Durable TaskRun records keyed by `{service}-{task_id}`
#[derive(Default)]
pub struct TaskRunStore {
    runs: DashMap<String, TaskRun>,
}

impl TaskRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new TaskRun. Rejects with [`StoreError::DuplicateActive`]
    /// when a non-terminal run already exists under the same key; a
    /// retained terminal record is replaced by the new submission.
    pub fn admit(&self, mut run: TaskRun) -> Result<TaskRun, StoreError> {
        let key = run
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::NotFound("unnamed TaskRun".to_string()))?;

        run.metadata.resource_version = Some("1".to_string());

        match self.runs.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().state().is_terminal() {
                    return Err(StoreError::DuplicateActive(key));
                }
                entry.insert(run.clone());
                Ok(run)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(run.clone());
                Ok(run)
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<TaskRun> {
        self.runs.get(key).map(|r| r.clone())
    }

    /// Keys of all runs that still need reconciliation
    #[must_use]
    pub fn non_terminal_keys(&self) -> Vec<String> {
        self.runs
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Replace the status of a run, write-ahead of any dependent external
    /// action. `expected_version` must match the version the caller read.
    pub fn patch_status(
        &self,
        key: &str,
        expected_version: &str,
        status: TaskRunStatus,
    ) -> Result<TaskRun, StoreError> {
        let mut entry = self
            .runs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let found = entry
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| "0".to_string());
        if found != expected_version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_version.to_string(),
                found,
            });
        }

        entry.status = Some(status);
        bump_version(&mut entry.metadata);
        Ok(entry.clone())
    }
}

/// Durable Runner records keyed by `{pool_group}/{runner_id}`
#[derive(Default)]
pub struct RunnerStore {
    runners: DashMap<String, Runner>,
}

fn runner_key(pool_group: &str, runner_id: &str) -> String {
    format!("{pool_group}/{runner_id}")
}

impl RunnerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut runner: Runner) {
        let key = runner_key(&runner.spec.pool_group, &runner.spec.runner_id);
        runner.metadata.resource_version = Some("1".to_string());
        self.runners.insert(key, runner);
    }

    #[must_use]
    pub fn get(&self, pool_group: &str, runner_id: &str) -> Option<Runner> {
        self.runners
            .get(&runner_key(pool_group, runner_id))
            .map(|r| r.clone())
    }

    #[must_use]
    pub fn list_group(&self, pool_group: &str) -> Vec<Runner> {
        self.runners
            .iter()
            .filter(|entry| entry.value().spec.pool_group == pool_group)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn patch_status(
        &self,
        pool_group: &str,
        runner_id: &str,
        expected_version: &str,
        status: RunnerStatus,
    ) -> Result<Runner, StoreError> {
        let key = runner_key(pool_group, runner_id);
        let mut entry = self
            .runners
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let found = entry
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| "0".to_string());
        if found != expected_version {
            return Err(StoreError::Conflict {
                key,
                expected: expected_version.to_string(),
                found,
            });
        }

        entry.status = Some(status);
        bump_version(&mut entry.metadata);
        Ok(entry.clone())
    }

    /// Drop a runner record entirely (end of an ephemeral runner's one-shot life)
    pub fn remove(&self, pool_group: &str, runner_id: &str) {
        self.runners.remove(&runner_key(pool_group, runner_id));
    }
}
