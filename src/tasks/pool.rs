//! Runner pool manager.
//!
//! Keeps each configured pool group at its desired number of active
//! ephemeral runners. Runners are one-shot: a runner that finishes (or
//! fails to register, or loses its workload) is marked Offline, its
//! record is pruned on the following cycle, and the top-up step creates
//! a fresh replacement. Offline runners are never restarted.

use crate::crds::{Runner, RunnerSpec, RunnerState, RunnerStatus};
use crate::state::StoreError;
use crate::tasks::config::ControllerConfig;
use crate::tasks::registration::RegistrationOutcome;
use crate::tasks::types::{Context, Error, Result};
use crate::workloads::{ContainerSpec, WorkloadError, WorkloadPhase, WorkloadSpec};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[must_use]
pub fn runner_workload_name(runner_id: &str) -> String {
    format!("runner-{runner_id}")
}

/// Workload backing one ephemeral runner. No init phase; the runner
/// process registers itself for work once the controller confirms it
/// with the execution-acceptance service.
#[must_use]
pub fn runner_workload_spec(runner: &Runner, config: &ControllerConfig) -> WorkloadSpec {
    WorkloadSpec {
        name: runner_workload_name(&runner.spec.runner_id),
        labels: BTreeMap::from([
            ("app".to_string(), "runner".to_string()),
            ("pool-group".to_string(), runner.spec.pool_group.clone()),
        ]),
        init: None,
        main: ContainerSpec {
            image: config.workload.runner_image.clone(),
            command: vec!["runner".to_string()],
            env: vec![
                ("RUNNER_ID".to_string(), runner.spec.runner_id.clone()),
                ("POOL_GROUP".to_string(), runner.spec.pool_group.clone()),
                (
                    "REGISTRATION_ENDPOINT".to_string(),
                    config.registration_endpoint.clone(),
                ),
            ],
            env_from_secrets: vec![],
        },
        active_deadline_seconds: config.workload.active_deadline_seconds,
    }
}

/// Apply a validated state transition to a runner record
fn transition_runner(
    ctx: &Context,
    runner: &Runner,
    next_state: RunnerState,
    mutate: impl FnOnce(&mut RunnerStatus),
) -> Result<Runner> {
    let current = runner.state();
    if !current.can_transition_to(next_state) {
        return Err(Error::InvalidTransition(format!(
            "runner {} cannot move {current} -> {next_state}",
            runner.spec.runner_id
        )));
    }

    let mut status = runner.status.clone().unwrap_or_default();
    status.state = next_state;
    status.last_transition_at = Some(now());
    mutate(&mut status);

    let version = runner.metadata.resource_version.as_deref().unwrap_or("0");
    Ok(ctx.runners.patch_status(
        &runner.spec.pool_group,
        &runner.spec.runner_id,
        version,
        status,
    )?)
}

/// Provision one new runner: persist the record, create its workload,
/// then register it with the execution-acceptance service under the
/// registration deadline. Any registration failure marks the runner
/// Offline; the next pool cycle replaces it.
#[instrument(skip(ctx), fields(pool_group = %pool_group))]
pub async fn provision_runner(pool_group: &str, ctx: &Context) -> Result<Runner> {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let runner_id = format!("{pool_group}-{}", &suffix[..8]);

    let mut runner = Runner::new(
        &runner_id,
        RunnerSpec {
            runner_id: runner_id.clone(),
            pool_group: pool_group.to_string(),
            ephemeral: true,
        },
    );
    runner.status = Some(RunnerStatus {
        state: RunnerState::Provisioning,
        workload_ref: None,
        bound_task_id: None,
        last_transition_at: Some(now()),
    });
    ctx.runners.insert(runner);
    let runner = ctx
        .runners
        .get(pool_group, &runner_id)
        .ok_or_else(|| StoreError::NotFound(runner_id.clone()))?;

    let spec = runner_workload_spec(&runner, &ctx.config);
    let workload_ref = match ctx.launcher.create(&spec).await {
        Ok(name) | Err(WorkloadError::AlreadyExists(name)) => name,
        Err(e) => {
            warn!("Runner workload creation failed for {}: {}", runner_id, e);
            let offline = transition_runner(ctx, &runner, RunnerState::Offline, |_| {})?;
            return Ok(offline);
        }
    };

    let mut status = runner.status.clone().unwrap_or_default();
    status.workload_ref = Some(workload_ref.clone());
    let version = runner.metadata.resource_version.as_deref().unwrap_or("0");
    let runner = ctx
        .runners
        .patch_status(pool_group, &runner_id, version, status)?;

    let deadline = Duration::from_secs(ctx.config.pool.registration_deadline_seconds);
    let registered = match tokio::time::timeout(deadline, ctx.registration.register(&runner_id))
        .await
    {
        Ok(Ok(RegistrationOutcome::Online)) => true,
        Ok(Ok(RegistrationOutcome::Rejected)) => {
            warn!("Runner {} rejected by acceptance service", runner_id);
            false
        }
        Ok(Err(e)) => {
            warn!("Runner {} registration failed: {}", runner_id, e);
            false
        }
        Err(_) => {
            warn!(
                "Runner {} registration exceeded {}s deadline",
                runner_id, ctx.config.pool.registration_deadline_seconds
            );
            false
        }
    };

    if registered {
        let runner = transition_runner(ctx, &runner, RunnerState::Registered, |_| {})?;
        info!("Runner {} online in pool {}", runner_id, pool_group);
        Ok(runner)
    } else {
        if let Err(e) = ctx.launcher.terminate(&workload_ref).await {
            warn!("Failed to terminate unregistered runner {}: {}", runner_id, e);
        }
        transition_runner(ctx, &runner, RunnerState::Offline, |_| {})
    }
}

/// A runner's workload has finished or vanished. The runner only goes
/// Offline here; the pool cycle creates the replacement, so a burst of
/// simultaneous exits never provisions more than the deficit.
pub async fn handle_runner_exit(runner: &Runner, ctx: &Context) -> Result<Runner> {
    ctx.registration.deregister(&runner.spec.runner_id).await;
    transition_runner(ctx, runner, RunnerState::Offline, |status| {
        status.bound_task_id = None;
    })
}

/// Registered -> Busy, recording the task the runner accepted
pub fn mark_runner_busy(
    ctx: &Context,
    pool_group: &str,
    runner_id: &str,
    task_id: u32,
) -> Result<Runner> {
    let runner = ctx
        .runners
        .get(pool_group, runner_id)
        .ok_or_else(|| StoreError::NotFound(runner_id.to_string()))?;
    transition_runner(ctx, &runner, RunnerState::Busy, |status| {
        status.bound_task_id = Some(task_id);
    })
}

/// Busy -> Terminating, once the runner's single job is done
pub fn mark_runner_terminating(ctx: &Context, pool_group: &str, runner_id: &str) -> Result<Runner> {
    let runner = ctx
        .runners
        .get(pool_group, runner_id)
        .ok_or_else(|| StoreError::NotFound(runner_id.to_string()))?;
    transition_runner(ctx, &runner, RunnerState::Terminating, |_| {})
}

async fn sweep_runner(runner: &Runner, ctx: &Context) -> Result<()> {
    let state = runner.state();
    if state == RunnerState::Offline {
        return Ok(());
    }

    let Some(workload_ref) = runner.status.as_ref().and_then(|s| s.workload_ref.clone()) else {
        // Provisioning records without a workload are still in flight
        return Ok(());
    };

    match ctx.launcher.status(&workload_ref).await? {
        WorkloadPhase::Scheduling | WorkloadPhase::Initializing | WorkloadPhase::Running => Ok(()),
        WorkloadPhase::Succeeded
        | WorkloadPhase::Failed { .. }
        | WorkloadPhase::InitFailed { .. }
        | WorkloadPhase::Gone => {
            info!(
                "Runner {} workload finished, taking it offline",
                runner.spec.runner_id
            );
            handle_runner_exit(runner, ctx).await.map(|_| ())
        }
    }
}

/// One pool reconciliation cycle: prune spent records, sweep workload
/// phases, then top the group back up to its desired count. Returns the
/// number of runners provisioned.
#[instrument(skip(ctx), fields(pool_group = %pool_group))]
pub async fn reconcile_pool(pool_group: &str, ctx: &Context) -> Result<u32> {
    let Some(desired) = ctx.config.desired_runners(pool_group) else {
        return Ok(0);
    };

    // Offline ephemeral runners marked on an earlier cycle are spent
    for runner in ctx.runners.list_group(pool_group) {
        if runner.state() == RunnerState::Offline && runner.spec.ephemeral {
            ctx.runners.remove(pool_group, &runner.spec.runner_id);
        }
    }

    for runner in ctx.runners.list_group(pool_group) {
        if let Err(e) = sweep_runner(&runner, ctx).await {
            warn!("Sweep failed for runner {}: {}", runner.spec.runner_id, e);
        }
    }

    let active = ctx
        .runners
        .list_group(pool_group)
        .iter()
        .filter(|r| r.state().is_active())
        .count() as u32;

    let mut created = 0;
    while active + created < desired {
        if let Err(e) = provision_runner(pool_group, ctx).await {
            error!("Failed to provision runner in pool {}: {}", pool_group, e);
            break;
        }
        created += 1;
    }

    if created > 0 {
        info!(
            "Pool {} topped up: {} active, {} provisioned, {} desired",
            pool_group, active, created, desired
        );
    }
    Ok(created)
}

/// Periodic control loop for one pool group; runs until the process exits
pub async fn run_pool_manager(pool_group: String, ctx: Context) {
    let period = Duration::from_secs(ctx.config.pool.interval_seconds);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        "Pool manager for {} running every {}s",
        pool_group, ctx.config.pool.interval_seconds
    );
    loop {
        interval.tick().await;
        if let Err(e) = reconcile_pool(&pool_group, &ctx).await {
            error!("Pool reconciliation failed for {}: {}", pool_group, e);
        }
    }
}
