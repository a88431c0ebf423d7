/// Liveness probing for pooled connections
pub mod version;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::transport::Transport;

pub use version::VersionHealthChecker;

/// Health status of a connection or server
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a usable connection
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe an open connection with a cheap command
    async fn check_connection(&self, transport: &mut dyn Transport) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Runs a checker under its timeout
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Probe a connection; a probe that overruns its timeout is reported as `Timeout`
    pub async fn probe(&self, server: &str, transport: &mut dyn Transport) -> HealthStatus {
        let check_timeout = self.checker.check_timeout();

        let status = match timeout(check_timeout, self.checker.check_connection(transport)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        debug!("Probe of {} returned {}", server, status);
        status
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new(Box::new(VersionHealthChecker::default()))
    }
}
