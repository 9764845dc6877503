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

//! Workspace preparation init container.
//!
//! Reads its inputs from the environment, prepares the checkout, and
//! exits with a code that carries the error classification back to the
//! workload launcher: 0 ready, 10 auth rejected, 11 repository not
//! found, 12 network error.

use orchestrator::workspace::{EnvCredentialResolver, GitCliFetcher, WorkspacePreparer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn required_env(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => {
            error!("Missing required environment variable {}", name);
            std::process::exit(orchestrator::workspace::exit_codes::NETWORK_ERROR);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let repository_url = required_env("REPOSITORY_URL");
    let credential_ref = required_env("CREDENTIAL_REF");
    let target_dir = PathBuf::from(required_env("TARGET_DIR"));
    let workspace_root =
        std::env::var("WORKSPACE_ROOT").unwrap_or_else(|_| "/workspace".to_string());

    info!(
        "Preparing workspace for {} in {}",
        repository_url,
        target_dir.display()
    );

    let preparer = WorkspacePreparer::new(
        workspace_root,
        Arc::new(EnvCredentialResolver),
        Arc::new(GitCliFetcher::default()),
    );

    match preparer
        .prepare(&repository_url, &credential_ref, &target_dir)
        .await
    {
        Ok(()) => {
            info!("Workspace ready");
            std::process::exit(orchestrator::workspace::exit_codes::READY);
        }
        Err(e) => {
            error!("Workspace preparation failed: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
