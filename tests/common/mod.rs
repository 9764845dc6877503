#![allow(dead_code)]

//! Shared test doubles for driving the reconcilers without a cluster.

use async_trait::async_trait;
use orchestrator::crds::TaskDocument;
use orchestrator::state::{RunnerStore, TaskRunStore};
use orchestrator::tasks::config::ControllerConfig;
use orchestrator::tasks::gateway::NewTask;
use orchestrator::tasks::registration::{
    RegistrationClient, RegistrationError, RegistrationOutcome,
};
use orchestrator::tasks::types::Context;
use orchestrator::workloads::{WorkloadError, WorkloadLauncher, WorkloadPhase, WorkloadSpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// Launcher that records every call and serves scripted phases.
/// Workloads come up in `initial_phase`; tests flip phases with
/// [`FakeLauncher::set_phase`] to simulate substrate progress.
pub struct FakeLauncher {
    initial_phase: WorkloadPhase,
    phases: Mutex<HashMap<String, WorkloadPhase>>,
    create_calls: AtomicUsize,
    terminated: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new(initial_phase: WorkloadPhase) -> Arc<Self> {
        Arc::new(Self {
            initial_phase,
            phases: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
        })
    }

    pub fn set_phase(&self, workload_ref: &str, phase: WorkloadPhase) {
        self.phases
            .lock()
            .unwrap()
            .insert(workload_ref.to_string(), phase);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    /// Number of workloads currently known to the substrate
    pub fn live_workloads(&self) -> usize {
        self.phases.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkloadLauncher for FakeLauncher {
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, WorkloadError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut phases = self.phases.lock().unwrap();
        if phases.contains_key(&spec.name) {
            return Err(WorkloadError::AlreadyExists(spec.name.clone()));
        }
        phases.insert(spec.name.clone(), self.initial_phase.clone());
        Ok(spec.name.clone())
    }

    async fn status(&self, workload_ref: &str) -> Result<WorkloadPhase, WorkloadError> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .get(workload_ref)
            .cloned()
            .unwrap_or(WorkloadPhase::Gone))
    }

    async fn terminate(&self, workload_ref: &str) -> Result<(), WorkloadError> {
        self.terminated.lock().unwrap().push(workload_ref.to_string());
        self.phases.lock().unwrap().remove(workload_ref);
        Ok(())
    }
}

/// Registration client serving a fixed outcome and recording calls
pub struct FakeRegistration {
    outcome: RegistrationOutcome,
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
}

impl FakeRegistration {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            outcome: RegistrationOutcome::Online,
            registered: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            outcome: RegistrationOutcome::Rejected,
            registered: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
        })
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrationClient for FakeRegistration {
    async fn register(&self, runner_id: &str) -> Result<RegistrationOutcome, RegistrationError> {
        self.registered.lock().unwrap().push(runner_id.to_string());
        Ok(self.outcome)
    }

    async fn deregister(&self, runner_id: &str) {
        self.deregistered
            .lock()
            .unwrap()
            .push(runner_id.to_string());
    }
}

/// Context wired with the given fakes and default configuration
pub fn test_context(
    launcher: Arc<FakeLauncher>,
    registration: Arc<FakeRegistration>,
) -> (Context, UnboundedReceiver<String>) {
    test_context_with(launcher, registration, ControllerConfig::default())
}

pub fn test_context_with(
    launcher: Arc<FakeLauncher>,
    registration: Arc<FakeRegistration>,
    config: ControllerConfig,
) -> (Context, UnboundedReceiver<String>) {
    let (queue, queue_rx) = tokio::sync::mpsc::unbounded_channel();
    (
        Context {
            task_runs: Arc::new(TaskRunStore::new()),
            runners: Arc::new(RunnerStore::new()),
            launcher,
            registration,
            config: Arc::new(config),
            queue,
        },
        queue_rx,
    )
}

pub fn sample_task(service: &str, task_id: u32) -> NewTask {
    NewTask {
        task_id,
        service: service.to_string(),
        agent_id: "agent-rex".to_string(),
        repository_url: "https://github.com/example/good-repo".to_string(),
        credential_ref: "valid".to_string(),
        taskmaster_dir_snapshot: vec![TaskDocument {
            filename: ".taskmaster/tasks/tasks.json".to_string(),
            content: "{\"tasks\":[]}".to_string(),
        }],
    }
}
