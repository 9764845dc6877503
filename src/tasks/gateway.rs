//! Submission gateway: validates and admits new task submissions.
//!
//! Admission is synchronous; reconciliation of the admitted run happens
//! asynchronously in the controller worker. The supplied Task Master
//! snapshot is stored immutably with the run, so later edits to the
//! source documents never affect an admitted TaskRun.

use crate::crds::taskrun::task_run_key;
use crate::crds::{TaskDocument, TaskRun, TaskRunSpec, TaskRunState, TaskRunStatus};
use crate::state::{StoreError, TaskRunStore};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Synchronous rejection of a task submission; no state is created
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("an active TaskRun already exists for {service}/{task_id}")]
    Duplicate { service: String, task_id: u32 },

    #[error("snapshot rejected: {0}")]
    InvalidSnapshot(String),
}

/// A task submission as received from the CLI/API layer
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub task_id: u32,
    pub service: String,
    pub agent_id: String,
    pub repository_url: String,
    pub credential_ref: String,
    pub taskmaster_dir_snapshot: Vec<TaskDocument>,
}

/// Filenames that mark a snapshot as containing a task descriptor,
/// following the Task Master directory layout
fn is_task_descriptor(filename: &str) -> bool {
    filename == "tasks.json"
        || filename.ends_with("/tasks.json")
        || filename == "task.md"
        || filename.ends_with("/task.md")
}

fn validate_snapshot(snapshot: &[TaskDocument]) -> Result<(), AdmissionError> {
    if snapshot.is_empty() {
        return Err(AdmissionError::InvalidSnapshot(
            "snapshot is empty".to_string(),
        ));
    }

    let has_descriptor = snapshot
        .iter()
        .any(|doc| is_task_descriptor(&doc.filename) && !doc.content.trim().is_empty());
    if !has_descriptor {
        return Err(AdmissionError::InvalidSnapshot(
            "snapshot contains no task descriptor (tasks.json or task.md)".to_string(),
        ));
    }

    Ok(())
}

/// Admit a new task submission.
///
/// Returns the persisted TaskRun (state Pending) synchronously and
/// enqueues it for reconciliation. Rejects duplicates of an active run
/// and snapshots without a recognizable task descriptor.
pub fn submit(
    store: &TaskRunStore,
    queue: &UnboundedSender<String>,
    task: NewTask,
) -> Result<TaskRun, AdmissionError> {
    validate_snapshot(&task.taskmaster_dir_snapshot)?;

    let key = task_run_key(&task.service, task.task_id);
    let now = chrono::Utc::now().to_rfc3339();

    let mut run = TaskRun::new(
        &key,
        TaskRunSpec {
            task_id: task.task_id,
            service: task.service.clone(),
            agent_id: task.agent_id,
            repository_url: task.repository_url,
            credential_ref: task.credential_ref,
            taskmaster_dir_snapshot: task.taskmaster_dir_snapshot,
        },
    );
    run.status = Some(TaskRunStatus {
        state: TaskRunState::Pending,
        workload_ref: None,
        attempt_count: 0,
        reason: None,
        message: Some("Admitted, awaiting reconciliation".to_string()),
        created_at: Some(now.clone()),
        last_transition_at: Some(now),
    });

    let admitted = store.admit(run).map_err(|e| match e {
        StoreError::DuplicateActive(_) => {
            warn!(
                "Rejecting duplicate submission for {}/{}",
                task.service, task.task_id
            );
            AdmissionError::Duplicate {
                service: task.service.clone(),
                task_id: task.task_id,
            }
        }
        other => AdmissionError::InvalidSnapshot(other.to_string()),
    })?;

    info!("Admitted TaskRun {} in state Pending", key);

    // The worker may have shut down; the resync loop will still pick the
    // run up, so a failed enqueue is not an admission failure
    let _ = queue.send(key);

    Ok(admitted)
}
