//! Health-check gate for an external HTTP dependency.
//!
//! Some steps need a service (an API server, a model proxy) to be up before
//! they run. [`DependencyGate`] polls the service's health endpoint until it
//! answers `200 OK` or a wall-clock deadline passes. Health-check failures are
//! never raised: a single check answers `false`, and polling answers `false`
//! once the deadline is reached.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GateError;

/// Default path probed on the dependency.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default timeout for a single health request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline used when `started + timeout` is not representable.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Polling client for one named dependency.
#[derive(Debug, Clone)]
pub struct DependencyGate {
    name: String,
    health_url: String,
    remediation: String,
    request_timeout: Duration,
    client: Client,
}

impl DependencyGate {
    /// Creates a gate probing `base_url` + `health_path`.
    ///
    /// # Errors
    ///
    /// Returns `GateError` if the URL is not http(s) or the HTTP client
    /// cannot be built.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        health_path: &str,
        request_timeout: Duration,
    ) -> Result<Self, GateError> {
        let base = base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(GateError::InvalidUrl {
                url: base_url.to_string(),
                reason: "must start with http:// or https://".to_string(),
            });
        }

        let path = if health_path.starts_with('/') {
            health_path.to_string()
        } else {
            format!("/{}", health_path)
        };

        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;

        let name = name.into();
        Ok(Self {
            remediation: format!("Make sure '{}' is running and reachable at {}.", name, base),
            name,
            health_url: format!("{}{}", base, path),
            request_timeout,
            client,
        })
    }

    /// Replaces the operator hint shown when the dependency never becomes ready.
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = remediation.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    /// How to start the dependency, for error messages.
    pub fn remediation(&self) -> &str {
        &self.remediation
    }

    /// Performs one health request. Any transport error or non-200 status
    /// counts as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let request = self.client.get(&self.health_url).send();

        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => true,
            Ok(Ok(response)) => {
                debug!(
                    dependency = %self.name,
                    status = %response.status(),
                    "Health check returned non-200"
                );
                false
            }
            Ok(Err(e)) => {
                debug!(dependency = %self.name, error = %e, "Health check request failed");
                false
            }
            Err(_) => {
                debug!(dependency = %self.name, "Health check timed out");
                false
            }
        }
    }

    /// Polls [`is_healthy`](Self::is_healthy) every `poll_interval` until it
    /// succeeds or `timeout` elapses.
    ///
    /// The deadline is enforced independently of individual request
    /// timeouts, so this never runs meaningfully past `timeout`.
    pub async fn wait_for_health(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let started = Instant::now();
        // Timeouts past what `Instant` can represent mean "wait indefinitely".
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + UNBOUNDED_WAIT);
        let poll_interval = poll_interval.max(Duration::from_millis(10));
        let mut attempts: u32 = 0;

        info!(
            dependency = %self.name,
            url = %self.health_url,
            timeout_secs = timeout.as_secs_f64(),
            "Waiting for dependency"
        );

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let healthy = tokio::time::timeout(remaining, self.is_healthy())
                .await
                .unwrap_or(false);
            if healthy {
                info!(
                    dependency = %self.name,
                    attempts = attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dependency healthy"
                );
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }

        warn!(
            dependency = %self.name,
            attempts = attempts,
            timeout_secs = timeout.as_secs_f64(),
            "Dependency not healthy before timeout"
        );
        false
    }
}
