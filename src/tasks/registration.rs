//! Runner registration with the external execution-acceptance service.
//!
//! Registration failures never surface to TaskRun callers; the pool
//! loop compensates by marking the runner Offline and creating a
//! replacement on its next cycle.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Online,
    Rejected,
}

/// Errors talking to the execution-acceptance service
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("execution-acceptance service unreachable: {0}")]
    Unreachable(String),
}

/// Interface to the excluded execution-acceptance service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    async fn register(&self, runner_id: &str) -> Result<RegistrationOutcome, RegistrationError>;

    /// Best-effort; a failed deregistration is logged and dropped
    async fn deregister(&self, runner_id: &str);
}

/// HTTP client for the execution-acceptance service
pub struct HttpRegistrationClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRegistrationClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn register(&self, runner_id: &str) -> Result<RegistrationOutcome, RegistrationError> {
        let url = format!("{}/runners/{}/register", self.base_url, runner_id);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            debug!("Runner {} registered", runner_id);
            Ok(RegistrationOutcome::Online)
        } else {
            warn!(
                "Runner {} registration rejected with status {}",
                runner_id,
                response.status()
            );
            Ok(RegistrationOutcome::Rejected)
        }
    }

    async fn deregister(&self, runner_id: &str) {
        let url = format!("{}/runners/{}", self.base_url, runner_id);
        if let Err(e) = self.http.delete(&url).send().await {
            warn!("Failed to deregister runner {}: {}", runner_id, e);
        }
    }
}
