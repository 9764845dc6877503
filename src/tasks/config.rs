//! Controller configuration
//!
//! Loaded from a mounted YAML file with serde defaults, validated at
//! startup, falling back to defaults when the file is missing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// TaskRun reconciliation settings
    #[serde(default)]
    pub task: TaskConfig,

    /// Runner pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Workload images and limits
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Root directory under which all workspaces are prepared
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// Namespace the controller operates in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Base URL of the execution-acceptance service used for runner
    /// registration
    #[serde(default = "default_registration_endpoint")]
    pub registration_endpoint: String,
}

/// TaskRun reconciliation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Retry cap for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential retry backoff, in seconds
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: u64,

    /// How often non-terminal runs are re-enqueued for reconciliation
    #[serde(default = "default_resync_seconds")]
    pub resync_seconds: u64,

    /// Phase polling interval while a workload is in flight
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,

    /// A run with no exit within this deadline is timed out
    #[serde(default = "default_task_deadline_seconds")]
    pub deadline_seconds: u64,
}

/// Runner pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Control loop period per pool group
    #[serde(default = "default_pool_interval_seconds")]
    pub interval_seconds: u64,

    /// Registration must complete within this deadline or the runner is
    /// marked Offline
    #[serde(default = "default_registration_deadline_seconds")]
    pub registration_deadline_seconds: u64,

    /// Pool groups and their desired runner counts
    #[serde(default = "default_groups")]
    pub groups: HashMap<String, PoolGroupConfig>,
}

/// Per-group pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolGroupConfig {
    /// Desired number of active runners
    #[serde(default = "default_desired")]
    pub desired: u32,
}

/// Workload images and limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkloadConfig {
    /// Agent container image
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    /// Workspace preparation init-container image
    #[serde(default = "default_prep_image")]
    pub prep_image: String,

    /// Runner container image
    #[serde(default = "default_runner_image")]
    pub runner_image: String,

    /// Job timeout in seconds
    #[serde(default = "default_active_deadline", rename = "activeDeadlineSeconds")]
    pub active_deadline_seconds: i64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_seconds() -> u64 {
    5
}

fn default_resync_seconds() -> u64 {
    30
}

fn default_poll_seconds() -> u64 {
    5
}

fn default_task_deadline_seconds() -> u64 {
    1800
}

fn default_pool_interval_seconds() -> u64 {
    5
}

fn default_registration_deadline_seconds() -> u64 {
    30
}

fn default_desired() -> u32 {
    2
}

fn default_groups() -> HashMap<String, PoolGroupConfig> {
    HashMap::from([("default".to_string(), PoolGroupConfig { desired: 2 })])
}

fn default_workspace_root() -> String {
    "/workspace".to_string()
}

fn default_namespace() -> String {
    "orchestrator".to_string()
}

fn default_registration_endpoint() -> String {
    "http://execution-gateway:8080".to_string()
}

fn default_agent_image() -> String {
    "MISSING_IMAGE_CONFIG".to_string()
}

fn default_prep_image() -> String {
    "MISSING_IMAGE_CONFIG".to_string()
}

fn default_runner_image() -> String {
    "MISSING_IMAGE_CONFIG".to_string()
}

fn default_active_deadline() -> i64 {
    3600
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_seconds: default_retry_backoff_seconds(),
            resync_seconds: default_resync_seconds(),
            poll_seconds: default_poll_seconds(),
            deadline_seconds: default_task_deadline_seconds(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_pool_interval_seconds(),
            registration_deadline_seconds: default_registration_deadline_seconds(),
            groups: default_groups(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            prep_image: default_prep_image(),
            runner_image: default_runner_image(),
            active_deadline_seconds: default_active_deadline(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            pool: PoolConfig::default(),
            workload: WorkloadConfig::default(),
            workspace_root: default_workspace_root(),
            namespace: default_namespace(),
            registration_endpoint: default_registration_endpoint(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration has usable values
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.task.max_attempts == 0 {
            return Err("task.max_attempts must be at least 1".into());
        }
        if self.pool.interval_seconds == 0 {
            return Err("pool.interval_seconds must be nonzero".into());
        }
        if self.workspace_root.trim().is_empty() {
            return Err("workspace_root must not be empty".into());
        }
        for (group, group_cfg) in &self.pool.groups {
            if group.trim().is_empty() {
                return Err("pool group names must not be empty".into());
            }
            if group_cfg.desired == 0 {
                return Err(format!("pool group '{group}' must have desired >= 1").into());
            }
        }
        Ok(())
    }

    /// Desired runner count for a group; unknown groups are not managed
    #[must_use]
    pub fn desired_runners(&self, pool_group: &str) -> Option<u32> {
        self.pool.groups.get(pool_group).map(|g| g.desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.task.max_attempts, 3);
        assert_eq!(config.pool.groups["default"].desired, 2);
        assert_eq!(config.workspace_root, "/workspace");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
task:
  max_attempts: 5
pool:
  groups:
    gpu:
      desired: 4
";
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.task.max_attempts, 5);
        assert_eq!(config.task.retry_backoff_seconds, 5);
        assert_eq!(config.pool.groups["gpu"].desired, 4);
        assert_eq!(config.desired_runners("gpu"), Some(4));
        assert_eq!(config.desired_runners("unknown"), None);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = ControllerConfig::default();
        config.task.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_desired() {
        let mut config = ControllerConfig::default();
        config
            .pool
            .groups
            .insert("empty".to_string(), PoolGroupConfig { desired: 0 });
        assert!(config.validate().is_err());
    }
}
