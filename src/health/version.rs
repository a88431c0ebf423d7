/// `version` command probe
use async_trait::async_trait;
use std::time::Duration;

use super::{HealthChecker, HealthStatus};
use crate::protocol::{Request, Response};
use crate::transport::Transport;

/// Sends `version` and expects a `VERSION` reply
pub struct VersionHealthChecker {
    check_timeout: Duration,
}

impl VersionHealthChecker {
    pub fn new(check_timeout: Duration) -> Self {
        Self { check_timeout }
    }
}

impl Default for VersionHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthChecker for VersionHealthChecker {
    async fn check_connection(&self, transport: &mut dyn Transport) -> HealthStatus {
        match transport.round_trip(&Request::Version).await {
            Ok(Response::Version(_)) => HealthStatus::Healthy,
            Ok(other) => HealthStatus::Unhealthy {
                reason: format!("Unexpected version response: {:?}", other),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("Version probe failed: {}", e),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}
