//! Task orchestration: submission gateway, TaskRun reconciler, runner
//! pool manager, and status aggregation.

pub mod config;
pub mod gateway;
pub mod pool;
pub mod registration;
pub mod status;
pub mod taskrun;
pub mod types;

pub use types::{Action, Context, Error, Result};

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// Run the TaskRun worker, the periodic resync, and one pool manager per
/// configured group. Returns when the reconciliation queue closes.
pub async fn run_controllers(ctx: Context, queue_rx: UnboundedReceiver<String>) {
    // Runs admitted before a restart still need reconciliation
    for key in ctx.task_runs.non_terminal_keys() {
        let _ = ctx.queue.send(key);
    }

    let resync = tokio::spawn(run_resync(ctx.clone()));
    let pools: Vec<_> = ctx
        .config
        .pool
        .groups
        .keys()
        .map(|group| tokio::spawn(pool::run_pool_manager(group.clone(), ctx.clone())))
        .collect();

    run_worker(ctx, queue_rx).await;

    resync.abort();
    for pool in pools {
        pool.abort();
    }
}

/// Periodically re-enqueue every non-terminal run. Deadlines fire and
/// lost enqueues heal even when no workload event arrives.
async fn run_resync(ctx: Context) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.config.task.resync_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for key in ctx.task_runs.non_terminal_keys() {
            let _ = ctx.queue.send(key);
        }
    }
}

/// Single worker consuming the reconciliation queue. Per-entity write
/// serialization comes from the versioned store, so one worker is about
/// ordering, not correctness.
async fn run_worker(ctx: Context, mut queue_rx: UnboundedReceiver<String>) {
    info!("TaskRun worker started");
    while let Some(key) = queue_rx.recv().await {
        match taskrun::reconcile_task_run(&key, &ctx).await {
            Ok(Action::AwaitChange) => {}
            Ok(Action::Requeue(delay)) if delay.is_zero() => {
                let _ = ctx.queue.send(key);
            }
            Ok(Action::Requeue(delay)) => requeue_after(&ctx, key, delay),
            Err(e) => {
                warn!("Reconciliation of {} failed, will retry: {}", key, e);
                requeue_after(&ctx, key, Duration::from_secs(ctx.config.task.poll_seconds));
            }
        }
    }
    info!("TaskRun worker stopped");
}

fn requeue_after(ctx: &Context, key: String, delay: Duration) {
    let queue = ctx.queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = queue.send(key);
    });
}
