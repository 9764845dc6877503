//! End-to-end TaskRun lifecycle tests driving the reconciler against a
//! scripted workload substrate.

mod common;

use common::{sample_task, test_context, FakeLauncher, FakeRegistration};
use orchestrator::crds::{TaskRunState, TaskRunStatus};
use orchestrator::tasks::gateway::{self, AdmissionError};
use orchestrator::tasks::taskrun::reconcile_task_run;
use orchestrator::tasks::types::{Action, Context};
use orchestrator::tasks::status::get_task_run;
use orchestrator::workloads::{PrepFailure, WorkloadPhase};

async fn step(ctx: &Context, key: &str) -> Action {
    reconcile_task_run(key, ctx).await.unwrap()
}

fn status_of(ctx: &Context, key: &str) -> TaskRunStatus {
    ctx.task_runs.get(key).unwrap().status.unwrap()
}

#[tokio::test]
async fn test_happy_path_reaches_succeeded() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap();
    let key = "svc-a-42";
    assert_eq!(ctx.task_runs.get(key).unwrap().state(), TaskRunState::Pending);

    // Pending -> WorkspacePreparing, persisted before any workload exists
    step(&ctx, key).await;
    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::WorkspacePreparing);
    assert_eq!(status.attempt_count, 1);
    assert!(status.workload_ref.is_none());

    // Workload created and bound under a deterministic name
    step(&ctx, key).await;
    let status = status_of(&ctx, key);
    assert_eq!(status.workload_ref.as_deref(), Some("svc-a-42-attempt-1"));
    assert_eq!(launcher.create_calls(), 1);

    // Still preparing while the init phase runs
    assert_eq!(
        step(&ctx, key).await,
        Action::requeue(std::time::Duration::from_secs(5))
    );
    assert_eq!(status_of(&ctx, key).state, TaskRunState::WorkspacePreparing);

    launcher.set_phase("svc-a-42-attempt-1", WorkloadPhase::Running);
    step(&ctx, key).await;
    assert_eq!(status_of(&ctx, key).state, TaskRunState::Running);

    launcher.set_phase("svc-a-42-attempt-1", WorkloadPhase::Succeeded);
    assert_eq!(step(&ctx, key).await, Action::await_change());
    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::Succeeded);
    assert_eq!(status.attempt_count, 1);
    assert!(status.reason.is_none());

    // Terminal runs are never reconciled again
    assert_eq!(step(&ctx, key).await, Action::await_change());
    assert_eq!(launcher.create_calls(), 1);
}

#[tokio::test]
async fn test_creation_is_idempotent() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 7)).unwrap();
    let key = "svc-a-7";
    step(&ctx, key).await;
    step(&ctx, key).await;

    // Repeated passes over the same observed state create nothing new
    for _ in 0..5 {
        step(&ctx, key).await;
    }
    assert_eq!(launcher.create_calls(), 1);
    assert_eq!(launcher.live_workloads(), 1);
}

#[tokio::test]
async fn test_lost_binding_adopts_existing_workload() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 7)).unwrap();
    let key = "svc-a-7";
    step(&ctx, key).await;
    step(&ctx, key).await;

    // Simulate a pass that created the workload but died before
    // persisting the binding
    let run = ctx.task_runs.get(key).unwrap();
    let mut status = run.status.clone().unwrap();
    status.workload_ref = None;
    ctx.task_runs
        .patch_status(key, run.metadata.resource_version.as_deref().unwrap(), status)
        .unwrap();

    step(&ctx, key).await;
    let status = status_of(&ctx, key);
    assert_eq!(status.workload_ref.as_deref(), Some("svc-a-7-attempt-1"));
    // The second create call hit AlreadyExists; only one workload exists
    assert_eq!(launcher.live_workloads(), 1);
}

#[tokio::test]
async fn test_auth_rejection_fails_without_retry() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 1)).unwrap();
    let key = "svc-a-1";
    step(&ctx, key).await;
    step(&ctx, key).await;

    launcher.set_phase(
        "svc-a-1-attempt-1",
        WorkloadPhase::InitFailed {
            failure: PrepFailure::AuthRejected,
        },
    );
    assert_eq!(step(&ctx, key).await, Action::await_change());

    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::Failed);
    assert_eq!(status.reason.as_deref(), Some("AuthRejected"));
    // Classified failures never burn retry attempts
    assert_eq!(status.attempt_count, 1);
    assert_eq!(launcher.create_calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    // Every attempt's init phase dies with a network error
    let launcher = FakeLauncher::new(WorkloadPhase::InitFailed {
        failure: PrepFailure::NetworkError,
    });
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 9)).unwrap();
    let key = "svc-a-9";
    step(&ctx, key).await;

    // Attempt 1 fails, retry scheduled with backoff
    step(&ctx, key).await;
    assert_eq!(
        step(&ctx, key).await,
        Action::requeue(std::time::Duration::from_secs(5))
    );
    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::WorkspacePreparing);
    assert_eq!(status.attempt_count, 2);
    assert!(status.workload_ref.is_none());

    // Attempt 2 fails, backoff doubles
    step(&ctx, key).await;
    assert_eq!(
        step(&ctx, key).await,
        Action::requeue(std::time::Duration::from_secs(10))
    );
    assert_eq!(status_of(&ctx, key).attempt_count, 3);

    // Attempt 3 fails; the cap finalizes the run
    step(&ctx, key).await;
    assert_eq!(step(&ctx, key).await, Action::await_change());

    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::Failed);
    assert_eq!(status.reason.as_deref(), Some("RetriesExhausted"));
    assert_eq!(status.attempt_count, 3);
    assert_eq!(launcher.create_calls(), 3);
}

#[tokio::test]
async fn test_running_deadline_times_out() {
    let launcher = FakeLauncher::new(WorkloadPhase::Running);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 3)).unwrap();
    let key = "svc-a-3";
    step(&ctx, key).await;
    step(&ctx, key).await;
    step(&ctx, key).await;
    assert_eq!(status_of(&ctx, key).state, TaskRunState::Running);

    // Rewind the transition timestamp past the deadline
    let run = ctx.task_runs.get(key).unwrap();
    let mut status = run.status.clone().unwrap();
    status.last_transition_at =
        Some((chrono::Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339());
    ctx.task_runs
        .patch_status(key, run.metadata.resource_version.as_deref().unwrap(), status)
        .unwrap();

    assert_eq!(step(&ctx, key).await, Action::await_change());
    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::TimedOut);
    assert_eq!(status.reason.as_deref(), Some("DeadlineExceeded"));
    // Cooperative termination was requested
    assert_eq!(launcher.terminated(), vec!["svc-a-3-attempt-1".to_string()]);
}

#[tokio::test]
async fn test_vanished_workload_retries() {
    let launcher = FakeLauncher::new(WorkloadPhase::Running);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 5)).unwrap();
    let key = "svc-a-5";
    step(&ctx, key).await;
    step(&ctx, key).await;
    step(&ctx, key).await;
    assert_eq!(status_of(&ctx, key).state, TaskRunState::Running);

    launcher.set_phase("svc-a-5-attempt-1", WorkloadPhase::Gone);
    step(&ctx, key).await;

    let status = status_of(&ctx, key);
    assert_eq!(status.state, TaskRunState::WorkspacePreparing);
    assert_eq!(status.reason.as_deref(), Some("WorkloadGone"));
    assert_eq!(status.attempt_count, 2);
}

#[tokio::test]
async fn test_duplicate_submission_rejected_while_active() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher, FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap();
    let err =
        gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap_err();
    assert!(matches!(err, AdmissionError::Duplicate { .. }));
}

#[tokio::test]
async fn test_resubmission_allowed_after_terminal_state() {
    let launcher = FakeLauncher::new(WorkloadPhase::Succeeded);
    let (ctx, _rx) = test_context(launcher.clone(), FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap();
    let key = "svc-a-42";
    step(&ctx, key).await;
    step(&ctx, key).await;
    step(&ctx, key).await;
    while status_of(&ctx, key).state != TaskRunState::Succeeded {
        step(&ctx, key).await;
    }

    // The retained terminal record no longer blocks a new submission
    let readmitted =
        gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap();
    assert_eq!(readmitted.state(), TaskRunState::Pending);
}

#[tokio::test]
async fn test_status_snapshot_reflects_persisted_state() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher, FakeRegistration::accepting());

    gateway::submit(&ctx.task_runs, &ctx.queue, sample_task("svc-a", 42)).unwrap();
    step(&ctx, "svc-a-42").await;

    let snapshot = get_task_run(&ctx.task_runs, "svc-a", 42).unwrap();
    assert_eq!(snapshot.state, TaskRunState::WorkspacePreparing);
    assert_eq!(snapshot.attempt_count, 1);
    assert!(snapshot.created_at.is_some());
}

#[tokio::test]
async fn test_unknown_key_is_a_no_op() {
    let launcher = FakeLauncher::new(WorkloadPhase::Initializing);
    let (ctx, _rx) = test_context(launcher, FakeRegistration::accepting());
    assert_eq!(step(&ctx, "nope-1").await, Action::await_change());
}
