//! Kubernetes-backed workload launcher.
//!
//! Workloads map onto `batch/v1` Jobs: the init container runs the
//! `workspace-prep` binary, the main container runs the agent (or the
//! runner process for pool workloads). Phase observation combines Job
//! conditions with pod container statuses; init-container exit codes
//! carry the workspace preparer's error classification.

use super::{
    ContainerSpec, PrepFailure, WorkloadError, WorkloadLauncher, WorkloadPhase, WorkloadSpec,
};
use crate::workspace::exit_codes;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

pub struct JobLauncher {
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl JobLauncher {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }

    fn render_container(name: &str, container: &ContainerSpec) -> serde_json::Value {
        let mut env: Vec<serde_json::Value> = container
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        for secret_env in &container.env_from_secrets {
            env.push(json!({
                "name": secret_env.name,
                "valueFrom": {
                    "secretKeyRef": {
                        "name": secret_env.secret_name,
                        "key": secret_env.secret_key
                    }
                }
            }));
        }

        json!({
            "name": name,
            "image": container.image,
            "command": container.command,
            "env": env,
            "volumeMounts": [{
                "name": "workspace",
                "mountPath": "/workspace"
            }]
        })
    }

    fn build_job(spec: &WorkloadSpec) -> Result<Job, WorkloadError> {
        let init_containers: Vec<serde_json::Value> = spec
            .init
            .as_ref()
            .map(|init| vec![Self::render_container("prepare-workspace", init)])
            .unwrap_or_default();

        let job_json = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": spec.name,
                "labels": spec.labels
            },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": spec.active_deadline_seconds,
                "template": {
                    "metadata": {
                        "labels": spec.labels
                    },
                    "spec": {
                        "restartPolicy": "Never",
                        "initContainers": init_containers,
                        "containers": [Self::render_container("main", &spec.main)],
                        "volumes": [{
                            "name": "workspace",
                            "emptyDir": {}
                        }]
                    }
                }
            }
        });

        serde_json::from_value(job_json).map_err(|e| WorkloadError::Api(e.to_string()))
    }

    fn init_failure_from_exit(exit_code: i32) -> PrepFailure {
        match exit_code {
            exit_codes::AUTH_REJECTED => PrepFailure::AuthRejected,
            exit_codes::REPO_NOT_FOUND => PrepFailure::RepoNotFound,
            // Unknown init failures are retried (bounded) rather than
            // treated as permanent
            _ => PrepFailure::NetworkError,
        }
    }

    fn phase_from_pod(pod: &Pod) -> WorkloadPhase {
        let Some(status) = &pod.status else {
            return WorkloadPhase::Scheduling;
        };

        if let Some(init_statuses) = &status.init_container_statuses {
            for init in init_statuses {
                if let Some(terminated) = init.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                    if terminated.exit_code != 0 {
                        return WorkloadPhase::InitFailed {
                            failure: Self::init_failure_from_exit(terminated.exit_code),
                        };
                    }
                } else {
                    return WorkloadPhase::Initializing;
                }
            }
        }

        let main_status: Option<&ContainerStatus> = status
            .container_statuses
            .as_ref()
            .and_then(|cs| cs.iter().find(|c| c.name == "main"));

        match main_status.and_then(|c| c.state.as_ref()) {
            Some(state) => {
                if let Some(terminated) = &state.terminated {
                    if terminated.exit_code == 0 {
                        WorkloadPhase::Succeeded
                    } else {
                        WorkloadPhase::Failed {
                            exit_code: terminated.exit_code,
                        }
                    }
                } else if state.running.is_some() {
                    WorkloadPhase::Running
                } else {
                    WorkloadPhase::Initializing
                }
            }
            None => WorkloadPhase::Initializing,
        }
    }
}

#[async_trait]
impl WorkloadLauncher for JobLauncher {
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, WorkloadError> {
        let job = Self::build_job(spec)?;

        match self.jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!("Created workload job: {}", spec.name);
                Ok(spec.name.clone())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Workload job already exists: {}", spec.name);
                Err(WorkloadError::AlreadyExists(spec.name.clone()))
            }
            Err(e) => Err(WorkloadError::Api(e.to_string())),
        }
    }

    async fn status(&self, workload_ref: &str) -> Result<WorkloadPhase, WorkloadError> {
        let Some(job) = self
            .jobs
            .get_opt(workload_ref)
            .await
            .map_err(|e| WorkloadError::Api(e.to_string()))?
        else {
            return Ok(WorkloadPhase::Gone);
        };

        if let Some(conditions) = job.status.as_ref().and_then(|s| s.conditions.as_ref()) {
            for condition in conditions {
                if condition.type_ == "Complete" && condition.status == "True" {
                    return Ok(WorkloadPhase::Succeeded);
                }
            }
        }

        let pods = self
            .pods
            .list(&ListParams::default().labels(&format!("job-name={workload_ref}")))
            .await
            .map_err(|e| WorkloadError::Api(e.to_string()))?;

        let Some(pod) = pods.items.first() else {
            // Job accepted but nothing scheduled yet; a Failed condition
            // without surviving pods reads as an unexpected disappearance
            let failed = job
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Failed" && c.status == "True")
                });
            return Ok(if failed {
                WorkloadPhase::Gone
            } else {
                WorkloadPhase::Scheduling
            });
        };

        Ok(Self::phase_from_pod(pod))
    }

    async fn terminate(&self, workload_ref: &str) -> Result<(), WorkloadError> {
        match self
            .jobs
            .delete(workload_ref, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Requested termination of workload job: {}", workload_ref);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => {
                warn!("Failed to terminate workload {}: {}", workload_ref, e);
                Err(WorkloadError::Api(e.to_string()))
            }
        }
    }
}
