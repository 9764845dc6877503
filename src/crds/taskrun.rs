//! `TaskRun` Custom Resource Definition for agent task submissions

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a secret for environment variable
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct SecretEnvVar {
    /// Name of the environment variable
    pub name: String,
    /// Name of the secret
    #[serde(rename = "secretName")]
    pub secret_name: String,
    /// Key within the secret
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

/// One document from the Task Master directory snapshot supplied at
/// submission time. The snapshot is stored verbatim and never mutated
/// after admission.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    /// Path-like filename within the snapshot (e.g. ".taskmaster/tasks/tasks.json")
    pub filename: String,

    /// Raw document content
    pub content: String,
}

/// `TaskRun` CRD: the durable record of one submitted agent job
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "TaskRun")]
#[kube(namespaced)]
#[kube(status = "TaskRunStatus")]
#[kube(printcolumn = r#"{"name":"Task","type":"integer","jsonPath":".spec.taskId"}"#)]
#[kube(printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    /// Caller-supplied task identifier, unique within a service namespace
    pub task_id: u32,

    /// Target service name
    pub service: String,

    /// Agent that executes the task
    pub agent_id: String,

    /// Target project repository URL (where implementation work happens)
    pub repository_url: String,

    /// Opaque credential reference, resolved by the workspace preparer at use time
    pub credential_ref: String,

    /// Ordered snapshot of the Task Master directory, immutable once admitted
    pub taskmaster_dir_snapshot: Vec<TaskDocument>,
}

/// Lifecycle state of a `TaskRun`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TaskRunState {
    #[default]
    Pending,
    WorkspacePreparing,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskRunState {
    /// Terminal states are retained but never reconciled again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskRunState::Succeeded | TaskRunState::Failed | TaskRunState::TimedOut
        )
    }
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRunState::Pending => write!(f, "Pending"),
            TaskRunState::WorkspacePreparing => write!(f, "WorkspacePreparing"),
            TaskRunState::Running => write!(f, "Running"),
            TaskRunState::Succeeded => write!(f, "Succeeded"),
            TaskRunState::Failed => write!(f, "Failed"),
            TaskRunState::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Status of the `TaskRun`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: TaskRunState,

    /// Identifier of the execution workload currently bound, if any.
    /// At most one non-terminal workload is ever bound at a time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<String>,

    /// Number of execution attempts, incremented per retry
    #[serde(default)]
    pub attempt_count: u32,

    /// Machine-readable reason code for the last transition
    /// (e.g. "AuthRejected", "RetriesExhausted", "AgentError")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the current state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Timestamp of admission (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    /// Last time the state changed (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,
}

impl TaskRun {
    /// Current state, defaulting to Pending when status was never written
    #[must_use]
    pub fn state(&self) -> TaskRunState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

/// Canonical store key for a `TaskRun`, unique per `(service, task_id)`
#[must_use]
pub fn task_run_key(service: &str, task_id: u32) -> String {
    format!("{service}-{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskrun_serialization() {
        let taskrun = TaskRun::new(
            "svc-a-42",
            TaskRunSpec {
                task_id: 42,
                service: "svc-a".to_string(),
                agent_id: "agent-rex".to_string(),
                repository_url: "https://github.com/example/good-repo".to_string(),
                credential_ref: "valid".to_string(),
                taskmaster_dir_snapshot: vec![TaskDocument {
                    filename: ".taskmaster/tasks/tasks.json".to_string(),
                    content: "{\"tasks\":[]}".to_string(),
                }],
            },
        );

        let json = serde_json::to_string_pretty(&taskrun).unwrap();
        let deserialized: TaskRun = serde_json::from_str(&json).unwrap();
        assert_eq!(taskrun.spec.task_id, deserialized.spec.task_id);
        assert_eq!(taskrun.spec.service, deserialized.spec.service);
    }

    #[test]
    fn test_state_terminality() {
        assert!(!TaskRunState::Pending.is_terminal());
        assert!(!TaskRunState::WorkspacePreparing.is_terminal());
        assert!(!TaskRunState::Running.is_terminal());
        assert!(TaskRunState::Succeeded.is_terminal());
        assert!(TaskRunState::Failed.is_terminal());
        assert!(TaskRunState::TimedOut.is_terminal());
    }

    #[test]
    fn test_state_serializes_as_plain_string() {
        let json = serde_json::to_string(&TaskRunState::WorkspacePreparing).unwrap();
        assert_eq!(json, "\"WorkspacePreparing\"");
    }

    #[test]
    fn test_task_run_key_format() {
        assert_eq!(task_run_key("svc-a", 42), "svc-a-42");
    }
}
