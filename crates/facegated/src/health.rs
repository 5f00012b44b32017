//! Worker liveness probing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::transport::WorkerTransport;

/// Outcome of one `/health` probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub healthy: bool,
    /// The worker's own health report, when healthy.
    pub info: Option<Value>,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    transport: Arc<dyn WorkerTransport>,
    timeout: Duration,
    last: Mutex<HashMap<String, WorkerHealth>>,
}

impl HealthMonitor {
    pub fn new(transport: Arc<dyn WorkerTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Probe `GET {base_url}/health` once. Never fails; every problem is
    /// reported as unhealthy.
    pub async fn check_health(&self, base_url: &str) -> WorkerHealth {
        let url = format!("{base_url}/health");
        let probe = tokio::time::timeout(self.timeout, self.transport.get(&url)).await;

        let info = match probe {
            Ok(Ok(reply)) if reply.is_success() && reply.body.is_object() => Some(reply.body),
            Ok(Ok(reply)) => {
                tracing::warn!(worker = base_url, status = reply.status, "worker reported unhealthy");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = base_url, error = %e, "health probe failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    worker = base_url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "health probe timed out"
                );
                None
            }
        };

        let health = WorkerHealth {
            healthy: info.is_some(),
            info,
            checked_at: Utc::now(),
        };
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(base_url.to_string(), health.clone());
        health
    }

    /// Most recent probe result for `base_url`, if any.
    pub fn last_known(&self, base_url: &str) -> Option<WorkerHealth> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(base_url)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::FakeTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_healthy_worker_reports_info() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("http://m/health", 200, json!({"status": "ok"}));
        let monitor = HealthMonitor::new(transport.clone(), Duration::from_secs(2));

        let health = monitor.check_health("http://m").await;
        assert!(health.healthy);
        assert_eq!(health.info.unwrap()["status"], "ok");
        assert!(monitor.last_known("http://m").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_error_status_and_bad_body_are_unhealthy() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("http://a/health", 500, json!({"status": "error"}));
        transport.respond("http://b/health", 200, json!("ok"));
        let monitor = HealthMonitor::new(transport, Duration::from_secs(2));

        for worker in ["http://a", "http://b"] {
            let health = monitor.check_health(worker).await;
            assert!(!health.healthy);
            assert!(health.info.is_none());
        }
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_unhealthy() {
        let transport = Arc::new(FakeTransport::new());
        let monitor = HealthMonitor::new(transport, Duration::from_secs(2));
        assert!(monitor.last_known("http://down").is_none());
        assert!(!monitor.check_health("http://down").await.healthy);
        assert!(!monitor.last_known("http://down").unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("http://slow/health", 200, json!({"status": "ok"}));
        transport.delay("http://slow/health", Duration::from_secs(10));
        let monitor = HealthMonitor::new(transport, Duration::from_secs(2));
        assert!(!monitor.check_health("http://slow").await.healthy);
    }
}
