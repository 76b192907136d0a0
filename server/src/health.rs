//! Payload backing `GET /health`.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Seconds since the server started.
    pub uptime: f64,
}

pub struct ServerHealth {
    started: Instant,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHealth {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_version_and_uptime() {
        let health = ServerHealth::new();
        let status = health.status();
        assert_eq!(status.status, "ok");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert!(status.uptime >= 0.0);
    }
}
