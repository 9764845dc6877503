//! TaskRun reconciler.
//!
//! Owns the per-submission state machine:
//!
//! ```text
//! Pending -> WorkspacePreparing -> Running -> Succeeded | Failed | TimedOut
//! ```
//!
//! Every transition is persisted write-ahead of the external action that
//! depends on it, and workload creation is idempotent: the reconciler
//! checks the persisted `workload_ref` binding (and relies on
//! deterministic workload naming) before creating anything, so two
//! passes over the same observed state never produce two workloads.

use crate::crds::taskrun::{task_run_key, SecretEnvVar};
use crate::crds::{TaskRun, TaskRunState, TaskRunStatus};
use crate::state::StoreError;
use crate::tasks::config::ControllerConfig;
use crate::tasks::types::{Action, Context, Error, Result};
use crate::workloads::{ContainerSpec, WorkloadError, WorkloadPhase, WorkloadSpec};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Secret holding the token behind a credential reference
#[must_use]
pub fn credential_secret_name(credential_ref: &str) -> String {
    format!("github-token-{credential_ref}")
}

/// Deterministic workload name for a given attempt; creating it twice
/// binds the same workload
#[must_use]
pub fn workload_name(run: &TaskRun, attempt: u32) -> String {
    format!(
        "{}-attempt-{attempt}",
        task_run_key(&run.spec.service, run.spec.task_id)
    )
}

/// Exponential backoff for the next retry after `attempts` failed ones
#[must_use]
pub fn backoff_delay(base_seconds: u64, attempts: u32) -> Duration {
    Duration::from_secs(base_seconds.saturating_mul(1 << attempts.saturating_sub(1).min(16)))
}

/// Build the two-phase workload for a TaskRun attempt: an init phase
/// running the workspace preparer, then the agent process
#[must_use]
pub fn task_workload_spec(run: &TaskRun, attempt: u32, config: &ControllerConfig) -> WorkloadSpec {
    let key = task_run_key(&run.spec.service, run.spec.task_id);
    let target_dir = format!(
        "{}/{}",
        config.workspace_root.trim_end_matches('/'),
        run.spec.service
    );
    let token_env = SecretEnvVar {
        name: "GITHUB_TOKEN".to_string(),
        secret_name: credential_secret_name(&run.spec.credential_ref),
        secret_key: "token".to_string(),
    };

    WorkloadSpec {
        name: workload_name(run, attempt),
        labels: BTreeMap::from([
            ("app".to_string(), "taskrun".to_string()),
            ("service".to_string(), run.spec.service.clone()),
            ("task-id".to_string(), run.spec.task_id.to_string()),
            ("attempt".to_string(), attempt.to_string()),
        ]),
        init: Some(ContainerSpec {
            image: config.workload.prep_image.clone(),
            command: vec!["workspace-prep".to_string()],
            env: vec![
                ("REPOSITORY_URL".to_string(), run.spec.repository_url.clone()),
                ("CREDENTIAL_REF".to_string(), run.spec.credential_ref.clone()),
                ("TARGET_DIR".to_string(), target_dir.clone()),
                ("WORKSPACE_ROOT".to_string(), config.workspace_root.clone()),
            ],
            env_from_secrets: vec![token_env.clone()],
        }),
        main: ContainerSpec {
            image: config.workload.agent_image.clone(),
            command: vec!["agent".to_string()],
            env: vec![
                ("TASKRUN_NAME".to_string(), key),
                ("SERVICE".to_string(), run.spec.service.clone()),
                ("TASK_ID".to_string(), run.spec.task_id.to_string()),
                ("AGENT_ID".to_string(), run.spec.agent_id.clone()),
                ("TARGET_DIR".to_string(), target_dir),
            ],
            env_from_secrets: vec![token_env],
        },
        active_deadline_seconds: config.workload.active_deadline_seconds,
    }
}

/// Reconcile one TaskRun by key. Idempotent: reconciling the same
/// persisted state twice performs the same (single) side effect.
#[instrument(skip(ctx), fields(task_run = %key))]
pub async fn reconcile_task_run(key: &str, ctx: &Context) -> Result<Action> {
    let Some(run) = ctx.task_runs.get(key) else {
        return Ok(Action::await_change());
    };

    match run.state() {
        TaskRunState::Pending => begin_preparation(&run, ctx),
        TaskRunState::WorkspacePreparing => reconcile_preparing(&run, ctx).await,
        TaskRunState::Running => reconcile_running(&run, ctx).await,
        TaskRunState::Succeeded | TaskRunState::Failed | TaskRunState::TimedOut => {
            Ok(Action::await_change())
        }
    }
}

/// Persist a status change. A version conflict means another pass owns
/// this run; the loser backs off and re-reads.
fn persist(ctx: &Context, run: &TaskRun, status: TaskRunStatus) -> Result<Option<TaskRun>> {
    let key = run
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::ConfigError("TaskRun has no name".to_string()))?;
    let version = run.metadata.resource_version.as_deref().unwrap_or("0");

    match ctx.task_runs.patch_status(key, version, status) {
        Ok(updated) => Ok(Some(updated)),
        Err(StoreError::Conflict { .. }) => {
            warn!("Concurrent update for TaskRun {}, backing off", key);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn next_status(run: &TaskRun, state: TaskRunState) -> TaskRunStatus {
    let mut status = run.status.clone().unwrap_or_default();
    status.state = state;
    status.last_transition_at = Some(now());
    status
}

fn poll_interval(ctx: &Context) -> Action {
    Action::requeue(Duration::from_secs(ctx.config.task.poll_seconds))
}

/// Pending -> WorkspacePreparing. Persisted before any workload exists;
/// the preparing pass performs the actual creation.
fn begin_preparation(run: &TaskRun, ctx: &Context) -> Result<Action> {
    let mut status = next_status(run, TaskRunState::WorkspacePreparing);
    status.attempt_count = 1;
    status.message = Some("Preparing workspace".to_string());
    status.reason = None;

    match persist(ctx, run, status)? {
        Some(_) => {
            info!("TaskRun {:?} entering WorkspacePreparing", run.metadata.name);
            Ok(Action::requeue(Duration::ZERO))
        }
        None => Ok(poll_interval(ctx)),
    }
}

async fn reconcile_preparing(run: &TaskRun, ctx: &Context) -> Result<Action> {
    let status = run.status.clone().unwrap_or_default();

    let Some(workload_ref) = status.workload_ref.clone() else {
        return create_workload(run, ctx).await;
    };

    match ctx.launcher.status(&workload_ref).await? {
        WorkloadPhase::Scheduling | WorkloadPhase::Initializing => Ok(poll_interval(ctx)),

        // Init phase completed; the agent is (or was) executing. Enter
        // Running first so no run skips the WorkspacePreparing->Running
        // edge; the Running pass observes any already-final phase.
        WorkloadPhase::Running | WorkloadPhase::Succeeded | WorkloadPhase::Failed { .. } => {
            let mut next = next_status(run, TaskRunState::Running);
            next.message = Some("Workspace ready, agent executing".to_string());
            match persist(ctx, run, next)? {
                Some(_) => Ok(Action::requeue(Duration::ZERO)),
                None => Ok(poll_interval(ctx)),
            }
        }

        WorkloadPhase::InitFailed { failure } => {
            if failure.is_transient() {
                retry_or_fail(run, ctx, failure.reason(), "workspace preparation failed").await
            } else {
                finalize(
                    run,
                    ctx,
                    TaskRunState::Failed,
                    Some(failure.reason()),
                    "Workspace preparation failed permanently",
                )
                .await
            }
        }

        WorkloadPhase::Gone => {
            retry_or_fail(run, ctx, "WorkloadGone", "workload disappeared unexpectedly").await
        }
    }
}

async fn create_workload(run: &TaskRun, ctx: &Context) -> Result<Action> {
    let status = run.status.clone().unwrap_or_default();
    let attempt = status.attempt_count.max(1);
    let spec = task_workload_spec(run, attempt, &ctx.config);

    let workload_ref = match ctx.launcher.create(&spec).await {
        Ok(name) => name,
        // Already created by an earlier pass that died before persisting
        // the binding; adopt it
        Err(WorkloadError::AlreadyExists(name)) => name,
        Err(e) if e.is_transient() => {
            warn!("Workload creation failed for {}: {}", spec.name, e);
            return retry_or_fail(run, ctx, "SchedulingFailed", &e.to_string()).await;
        }
        Err(e) => return Err(e.into()),
    };

    let mut next = status;
    next.workload_ref = Some(workload_ref.clone());
    next.message = Some(format!("Workload {workload_ref} created"));

    match persist(ctx, run, next)? {
        Some(_) => {
            info!("Bound workload {} to TaskRun attempt {}", workload_ref, attempt);
            Ok(poll_interval(ctx))
        }
        None => Ok(poll_interval(ctx)),
    }
}

async fn reconcile_running(run: &TaskRun, ctx: &Context) -> Result<Action> {
    let status = run.status.clone().unwrap_or_default();

    if deadline_exceeded(&status, ctx.config.task.deadline_seconds) {
        // Cooperative cancellation: request termination but finalize
        // TimedOut regardless of acknowledgment
        if let Some(workload_ref) = &status.workload_ref {
            if let Err(e) = ctx.launcher.terminate(workload_ref).await {
                warn!("Termination request for {} failed: {}", workload_ref, e);
            }
        }
        return finalize(
            run,
            ctx,
            TaskRunState::TimedOut,
            Some("DeadlineExceeded"),
            "No exit within the configured deadline",
        )
        .await;
    }

    let Some(workload_ref) = status.workload_ref.clone() else {
        return retry_or_fail(run, ctx, "WorkloadGone", "workload binding lost").await;
    };

    match ctx.launcher.status(&workload_ref).await? {
        WorkloadPhase::Scheduling | WorkloadPhase::Initializing | WorkloadPhase::Running => {
            Ok(poll_interval(ctx))
        }

        WorkloadPhase::Succeeded => {
            finalize(
                run,
                ctx,
                TaskRunState::Succeeded,
                None,
                "Agent completed successfully",
            )
            .await
        }

        // Agent failures are assumed deterministic per attempt: no retry
        WorkloadPhase::Failed { exit_code } => {
            finalize(
                run,
                ctx,
                TaskRunState::Failed,
                Some("AgentError"),
                &format!("Agent exited with code {exit_code}"),
            )
            .await
        }

        WorkloadPhase::InitFailed { failure } => {
            if failure.is_transient() {
                retry_or_fail(run, ctx, failure.reason(), "workload re-entered init and failed")
                    .await
            } else {
                finalize(
                    run,
                    ctx,
                    TaskRunState::Failed,
                    Some(failure.reason()),
                    "Workspace preparation failed permanently",
                )
                .await
            }
        }

        WorkloadPhase::Gone => {
            retry_or_fail(run, ctx, "WorkloadGone", "workload disappeared unexpectedly").await
        }
    }
}

/// Bounded retry for transient failures. Exceeding the cap finalizes
/// Failed with reason `RetriesExhausted`; otherwise the run re-enters
/// WorkspacePreparing with a fresh attempt and an exponential backoff.
async fn retry_or_fail(run: &TaskRun, ctx: &Context, reason: &str, detail: &str) -> Result<Action> {
    let status = run.status.clone().unwrap_or_default();
    let attempts = status.attempt_count.max(1);

    if attempts >= ctx.config.task.max_attempts {
        return finalize(
            run,
            ctx,
            TaskRunState::Failed,
            Some("RetriesExhausted"),
            &format!("Retry limit reached after {attempts} attempts ({reason}): {detail}"),
        )
        .await;
    }

    let mut next = next_status(run, TaskRunState::WorkspacePreparing);
    next.attempt_count = attempts + 1;
    next.workload_ref = None;
    next.reason = Some(reason.to_string());
    next.message = Some(format!(
        "Attempt {} of {} scheduled ({reason}): {detail}",
        attempts + 1,
        ctx.config.task.max_attempts
    ));

    match persist(ctx, run, next)? {
        Some(_) => {
            info!(
                "Scheduling retry {} of {} for TaskRun {:?}: {}",
                attempts + 1,
                ctx.config.task.max_attempts,
                run.metadata.name,
                reason
            );
            Ok(Action::requeue(backoff_delay(
                ctx.config.task.retry_backoff_seconds,
                attempts,
            )))
        }
        None => Ok(poll_interval(ctx)),
    }
}

async fn finalize(
    run: &TaskRun,
    ctx: &Context,
    state: TaskRunState,
    reason: Option<&str>,
    message: &str,
) -> Result<Action> {
    let mut status = next_status(run, state);
    status.reason = reason.map(str::to_string);
    status.message = Some(message.to_string());

    if persist(ctx, run, status)?.is_some() {
        info!("TaskRun {:?} finalized as {}", run.metadata.name, state);
        Ok(Action::await_change())
    } else {
        Ok(poll_interval(ctx))
    }
}

fn deadline_exceeded(status: &TaskRunStatus, deadline_seconds: u64) -> bool {
    let Some(since) = status
        .last_transition_at
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
    else {
        return false;
    };
    let elapsed = chrono::Utc::now().signed_duration_since(since);
    elapsed.num_seconds() >= 0 && elapsed.num_seconds() as u64 > deadline_seconds
}
