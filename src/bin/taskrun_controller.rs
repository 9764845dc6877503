/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! TaskRun Controller Service
//!
//! Runs the reconciliation worker, the runner pool managers, and the
//! HTTP surface for task submission and status queries.

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use orchestrator::state::{RunnerStore, TaskRunStore};
use orchestrator::tasks::{
    config::ControllerConfig,
    gateway::{self, AdmissionError, NewTask},
    registration::HttpRegistrationClient,
    run_controllers, status,
    types::Context,
};
use orchestrator::workloads::JobLauncher;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    task_runs: Arc<TaskRunStore>,
    runners: Arc<RunnerStore>,
    config: Arc<ControllerConfig>,
    queue: tokio::sync::mpsc::UnboundedSender<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting TaskRun Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_controller_config());
    config.validate()?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let task_runs = Arc::new(TaskRunStore::new());
    let runners = Arc::new(RunnerStore::new());
    let launcher = Arc::new(JobLauncher::new(client, &config.namespace));
    let registration = Arc::new(HttpRegistrationClient::new(
        config.registration_endpoint.clone(),
    ));

    let (queue_tx, queue_rx) = tokio::sync::mpsc::unbounded_channel();
    let ctx = Context {
        task_runs: task_runs.clone(),
        runners: runners.clone(),
        launcher,
        registration,
        config: config.clone(),
        queue: queue_tx.clone(),
    };

    // Run the reconcilers in the background
    let controller_handle = tokio::spawn(run_controllers(ctx, queue_rx));

    let state = AppState {
        task_runs,
        runners,
        config,
        queue: queue_tx,
    };

    // Build the HTTP router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/{service}/{task_id}", get(get_task))
        .route("/v1/pools/{pool_group}/health", get(get_pool_health))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Controller HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "taskrun-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "taskrun-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(task): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match gateway::submit(&state.task_runs, &state.queue, task) {
        Ok(run) => {
            let snapshot = status::get_task_run(&state.task_runs, &run.spec.service, run.spec.task_id);
            Ok((StatusCode::CREATED, Json(json!({ "taskRun": snapshot }))))
        }
        Err(e @ AdmissionError::Duplicate { .. }) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(e @ AdmissionError::InvalidSnapshot(_)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn get_task(
    State(state): State<AppState>,
    UrlPath((service, task_id)): UrlPath<(String, u32)>,
) -> Result<Json<Value>, StatusCode> {
    status::get_task_run(&state.task_runs, &service, task_id)
        .map(|snapshot| Json(json!({ "taskRun": snapshot })))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_pool_health(
    State(state): State<AppState>,
    UrlPath(pool_group): UrlPath<String>,
) -> Result<Json<Value>, StatusCode> {
    status::get_pool_health(&state.runners, &state.config, &pool_group)
        .map(|health| Json(json!({ "pool": health })))
        .ok_or(StatusCode::NOT_FOUND)
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
