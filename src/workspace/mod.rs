//! Workspace preparation.
//!
//! Given a repository reference and a credential reference, produce a
//! ready-to-use checkout in a target directory under the configured
//! workspace root, or fail with a classified error. Preparation always
//! clears the target directory before checkout so a retry after a
//! partial failure never leaves mixed old/new content.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod git;

pub use git::GitCliFetcher;

/// Marker file written on successful preparation; the agent process
/// waits for it before starting work
pub const READY_MARKER: &str = ".workspace-ready";

/// Init-container exit codes carrying the error classification to the
/// workload launcher
pub mod exit_codes {
    pub const READY: i32 = 0;
    pub const AUTH_REJECTED: i32 = 10;
    pub const REPO_NOT_FOUND: i32 = 11;
    pub const NETWORK_ERROR: i32 = 12;
}

/// Errors from workspace preparation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrepError {
    /// Credential resolution or remote authentication failed (classified, permanent)
    #[error("authentication rejected for credential reference")]
    AuthRejected,

    /// Definitive not-found response for the repository (classified, permanent)
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Connection failure during checkout (transient, retryable)
    #[error("network error during checkout: {0}")]
    NetworkError(String),

    /// Checkout exceeded its deadline (transient, retryable)
    #[error("checkout timed out after {0}s")]
    Timeout(u64),

    /// Target directory escapes the configured workspace root (classified)
    #[error("target directory outside workspace root: {0}")]
    OutsideWorkspaceRoot(String),

    /// Local filesystem failure (transient, retryable)
    #[error("workspace io error: {0}")]
    Io(String),
}

impl PrepError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PrepError::NetworkError(_) | PrepError::Timeout(_) | PrepError::Io(_)
        )
    }

    /// Process exit code for the `workspace-prep` init container
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            PrepError::AuthRejected | PrepError::OutsideWorkspaceRoot(_) => {
                exit_codes::AUTH_REJECTED
            }
            PrepError::RepoNotFound(_) => exit_codes::REPO_NOT_FOUND,
            PrepError::NetworkError(_) | PrepError::Timeout(_) | PrepError::Io(_) => {
                exit_codes::NETWORK_ERROR
            }
        }
    }
}

/// Interface to the excluded secret store. Tokens are resolved per use
/// and discarded; they are never persisted alongside the TaskRun.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve a credential reference to a token, or `None` when the
    /// reference is unknown
    async fn resolve(&self, credential_ref: &str) -> Option<String>;
}

/// Resolver used inside the workload init container: the launcher
/// injects the token from the referenced secret as `GITHUB_TOKEN`
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, _credential_ref: &str) -> Option<String> {
        std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())
    }
}

/// Checkout backend, separated so preparation logic is testable without
/// touching the network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn checkout(&self, repository_url: &str, token: &str, dir: &Path)
        -> Result<(), PrepError>;
}

/// Prepares workspaces under a fixed root directory
pub struct WorkspacePreparer {
    workspace_root: PathBuf,
    resolver: std::sync::Arc<dyn CredentialResolver>,
    fetcher: std::sync::Arc<dyn RepoFetcher>,
}

impl WorkspacePreparer {
    #[must_use]
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        resolver: std::sync::Arc<dyn CredentialResolver>,
        fetcher: std::sync::Arc<dyn RepoFetcher>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            resolver,
            fetcher,
        }
    }

    /// Prepare `target_dir` for the agent: resolve the credential, clear
    /// stale content, check out the repository at its default reference,
    /// and write the readiness marker.
    ///
    /// Safe to re-invoke on the same directory after a prior partial
    /// failure; the directory is cleared before every checkout, never
    /// merged.
    pub async fn prepare(
        &self,
        repository_url: &str,
        credential_ref: &str,
        target_dir: &Path,
    ) -> Result<(), PrepError> {
        self.confine(target_dir)?;

        let Some(token) = self.resolver.resolve(credential_ref).await else {
            warn!("Credential reference could not be resolved");
            return Err(PrepError::AuthRejected);
        };

        self.clear_target(target_dir).await?;

        info!(
            "Checking out {} into {}",
            repository_url,
            target_dir.display()
        );
        self.fetcher
            .checkout(repository_url, &token, target_dir)
            .await?;

        let marker = target_dir.join(READY_MARKER);
        tokio::fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .await
            .map_err(|e| PrepError::Io(e.to_string()))?;

        info!("Workspace ready: {}", target_dir.display());
        Ok(())
    }

    /// Only previously-configured workspace paths may be cleared; an
    /// arbitrary caller-supplied path outside the root is rejected
    /// before any destructive operation.
    fn confine(&self, target_dir: &Path) -> Result<(), PrepError> {
        let escapes = target_dir
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !target_dir.starts_with(&self.workspace_root) {
            return Err(PrepError::OutsideWorkspaceRoot(
                target_dir.display().to_string(),
            ));
        }
        Ok(())
    }

    async fn clear_target(&self, target_dir: &Path) -> Result<(), PrepError> {
        if tokio::fs::try_exists(target_dir)
            .await
            .map_err(|e| PrepError::Io(e.to_string()))?
        {
            debug!("Clearing stale workspace content: {}", target_dir.display());
            tokio::fs::remove_dir_all(target_dir)
                .await
                .map_err(|e| PrepError::Io(e.to_string()))?;
        }
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| PrepError::Io(e.to_string()))
    }
}
