//! `Runner` Custom Resource Definition for ephemeral execution slots

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_ephemeral() -> bool {
    true
}

/// `Runner` CRD: one ephemeral execution slot in a pool group.
///
/// An ephemeral runner accepts exactly one job and then self-terminates;
/// the pool manager creates a replacement on its next cycle.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "Runner")]
#[kube(namespaced)]
#[kube(status = "RunnerStatus")]
#[kube(printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolGroup"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Task","type":"integer","jsonPath":".status.boundTaskId"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    /// Unique runner identifier within the pool group
    pub runner_id: String,

    /// Pool group this runner belongs to
    pub pool_group: String,

    /// Ephemeral runners self-terminate after exactly one job
    #[serde(default = "default_ephemeral")]
    pub ephemeral: bool,
}

/// Lifecycle state of a `Runner`.
///
/// An ephemeral runner walks Provisioning → Registered → Busy →
/// Terminating → (removed) at most once; it is never reused.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RunnerState {
    #[default]
    Provisioning,
    Registered,
    Busy,
    Terminating,
    Offline,
}

impl RunnerState {
    /// Active runners count toward the pool's actual size
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunnerState::Provisioning | RunnerState::Registered | RunnerState::Busy
        )
    }

    /// Legal forward transitions of the one-shot runner state machine
    #[must_use]
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        match self {
            RunnerState::Provisioning => {
                matches!(next, RunnerState::Registered | RunnerState::Offline)
            }
            RunnerState::Registered => matches!(next, RunnerState::Busy | RunnerState::Offline),
            RunnerState::Busy => matches!(next, RunnerState::Terminating | RunnerState::Offline),
            RunnerState::Terminating => matches!(next, RunnerState::Offline),
            RunnerState::Offline => false,
        }
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Provisioning => write!(f, "Provisioning"),
            RunnerState::Registered => write!(f, "Registered"),
            RunnerState::Busy => write!(f, "Busy"),
            RunnerState::Terminating => write!(f, "Terminating"),
            RunnerState::Offline => write!(f, "Offline"),
        }
    }
}

/// Status of the `Runner`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: RunnerState,

    /// Backing workload identifier, if one has been created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<String>,

    /// Task currently bound to this runner, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_task_id: Option<u32>,

    /// Last time the state changed (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,
}

impl Runner {
    /// Current state, defaulting to Provisioning when status was never written
    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_transitions() {
        assert!(RunnerState::Provisioning.can_transition_to(RunnerState::Registered));
        assert!(RunnerState::Registered.can_transition_to(RunnerState::Busy));
        assert!(RunnerState::Busy.can_transition_to(RunnerState::Terminating));
        assert!(RunnerState::Terminating.can_transition_to(RunnerState::Offline));

        // Never reused: no path out of Offline, no backwards edges
        assert!(!RunnerState::Offline.can_transition_to(RunnerState::Registered));
        assert!(!RunnerState::Busy.can_transition_to(RunnerState::Registered));
        assert!(!RunnerState::Registered.can_transition_to(RunnerState::Provisioning));
    }

    #[test]
    fn test_active_states() {
        assert!(RunnerState::Provisioning.is_active());
        assert!(RunnerState::Registered.is_active());
        assert!(RunnerState::Busy.is_active());
        assert!(!RunnerState::Terminating.is_active());
        assert!(!RunnerState::Offline.is_active());
    }

    #[test]
    fn test_runner_serialization() {
        let runner = Runner::new(
            "gpu-a1b2c3d4",
            RunnerSpec {
                runner_id: "gpu-a1b2c3d4".to_string(),
                pool_group: "gpu".to_string(),
                ephemeral: true,
            },
        );
        let json = serde_json::to_string(&runner).unwrap();
        let back: Runner = serde_json::from_str(&json).unwrap();
        assert!(back.spec.ephemeral);
        assert_eq!(back.spec.pool_group, "gpu");
    }
}
