//! Request orchestration: validation, health gate, forwarding, registration
//! and environment management.
//!
//! Every forwarded request is a single attempt. Validation happens before any
//! network call, the health probe gates the forward, and the forward itself is
//! abandoned once the request timeout elapses.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use facegate_core::dataset::{validate_identity_name, DatasetError, DatasetStore};
use facegate_core::wire::{
    decode_image_payload, ImageRequest, RegisterRequest, RegisterResponse, UsersResponse,
};
use facegate_env::{EnvironmentState, ProvisionError, ProvisionReport, Provisioner};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::GatewayError;
use crate::health::{HealthMonitor, WorkerHealth};
use crate::transport::{TransportError, WorkerReply, WorkerTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Matching,
    Analysis,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Matching => f.write_str("matching"),
            Capability::Analysis => f.write_str("analysis"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub capability: Capability,
    pub base_url: String,
    /// Environment the worker runs in, when it is provisioned by us.
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    pub url: String,
    pub info: Option<Value>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsOverview {
    pub success: bool,
    pub environments: BTreeMap<String, EnvironmentState>,
    pub services: BTreeMap<String, ServiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResponse {
    pub success: bool,
    pub message: String,
    pub report: ProvisionReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub success: bool,
    pub needs_setup: bool,
    pub message: String,
}

pub struct Gateway {
    matcher: WorkerDescriptor,
    analyzer: WorkerDescriptor,
    transport: Arc<dyn WorkerTransport>,
    health: HealthMonitor,
    dataset: DatasetStore,
    provisioner: Arc<Provisioner>,
    request_timeout: Duration,
    invalidate_timeout: Duration,
    require_environments: bool,
}

impl Gateway {
    pub fn new(
        config: &Config,
        transport: Arc<dyn WorkerTransport>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        Self {
            matcher: WorkerDescriptor {
                capability: Capability::Matching,
                base_url: config.matcher_url.clone(),
                environment: Some(config.matcher_environment.clone()),
            },
            analyzer: WorkerDescriptor {
                capability: Capability::Analysis,
                base_url: config.analyzer_url.clone(),
                environment: Some(config.analyzer_environment.clone()),
            },
            health: HealthMonitor::new(transport.clone(), config.health_timeout),
            transport,
            dataset: DatasetStore::new(config.dataset_dir.clone()),
            provisioner,
            request_timeout: config.request_timeout,
            invalidate_timeout: config.invalidate_timeout,
            require_environments: config.require_environments,
        }
    }

    pub fn matcher(&self) -> &WorkerDescriptor {
        &self.matcher
    }

    pub fn analyzer(&self) -> &WorkerDescriptor {
        &self.analyzer
    }

    /// Result of the most recent probe of `worker`, without probing.
    pub fn last_health(&self, worker: &WorkerDescriptor) -> Option<WorkerHealth> {
        self.health.last_known(&worker.base_url)
    }

    /// Health-gate `worker`, then POST `body` to `path` and relay the reply.
    pub async fn forward(
        &self,
        worker: &WorkerDescriptor,
        path: &str,
        body: Value,
    ) -> Result<WorkerReply, GatewayError> {
        let health = self.health.check_health(&worker.base_url).await;
        if !health.healthy {
            return Err(GatewayError::ServiceUnavailable(format!(
                "{} worker is not available",
                worker.capability
            )));
        }

        let url = format!("{}{path}", worker.base_url);
        let call = tokio::time::timeout(self.request_timeout, self.transport.post_json(&url, &body));
        match call.await {
            Ok(Ok(reply)) => {
                tracing::debug!(worker = %worker.capability, path, status = reply.status, "forwarded");
                Ok(reply)
            }
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                tracing::warn!(worker = %worker.capability, path, "forward timed out");
                Err(GatewayError::GatewayTimeout(format!(
                    "{} worker did not answer within {}s",
                    worker.capability,
                    self.request_timeout.as_secs()
                )))
            }
            Ok(Err(TransportError::Connect(detail))) => {
                tracing::warn!(worker = %worker.capability, path, error = %detail, "forward failed to connect");
                Err(GatewayError::ServiceUnavailable(format!(
                    "{} worker is unreachable",
                    worker.capability
                )))
            }
            Ok(Err(TransportError::Other(message))) => {
                tracing::error!(worker = %worker.capability, path, error = %message, "forward failed");
                Err(GatewayError::Unknown(message))
            }
        }
    }

    pub async fn recognize(&self, request: ImageRequest) -> Result<WorkerReply, GatewayError> {
        validate_image(&request.image)?;
        self.forward(&self.matcher, "/recognize", json!({ "image": request.image }))
            .await
    }

    pub async fn analyze(&self, request: ImageRequest) -> Result<WorkerReply, GatewayError> {
        validate_image(&request.image)?;
        self.forward(&self.analyzer, "/analyze", json!({ "image": request.image }))
            .await
    }

    /// Store one sample image for `request.name`, then ask the matching
    /// worker to drop its cache. The invalidation result never affects the
    /// outcome; the cache TTL covers a missed call.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, GatewayError> {
        validate_identity_name(&request.name).map_err(|e| GatewayError::Validation(e.to_string()))?;
        let bytes = decode_image_payload(&request.image)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        self.require_ready(&self.matcher).await?;

        let dataset = self.dataset.clone();
        let name = request.name.clone();
        let stored = tokio::task::spawn_blocking(move || dataset.register(&name, &bytes))
            .await
            .map_err(join_error)?
            .map_err(dataset_error)?;

        self.invalidate_matcher().await;

        Ok(RegisterResponse {
            success: true,
            message: format!("registered image {} for {}", stored.image_count, request.name),
            count: stored.image_count,
        })
    }

    pub async fn users(&self) -> Result<UsersResponse, GatewayError> {
        let dataset = self.dataset.clone();
        let users = tokio::task::spawn_blocking(move || dataset.users())
            .await
            .map_err(join_error)?
            .map_err(dataset_error)?;
        Ok(UsersResponse {
            success: true,
            users,
        })
    }

    pub async fn check_environments(&self) -> Result<EnvironmentsOverview, GatewayError> {
        let environments = self
            .with_provisioner(|p| {
                let mut states = BTreeMap::new();
                for name in p.registry().names() {
                    states.insert(name.to_string(), p.status(name)?);
                }
                Ok(states)
            })
            .await?;

        let (matcher, analyzer) = tokio::join!(
            self.service_status(&self.matcher),
            self.service_status(&self.analyzer)
        );
        let services = BTreeMap::from([
            ("matcher".to_string(), matcher),
            ("analyzer".to_string(), analyzer),
        ]);

        Ok(EnvironmentsOverview {
            success: true,
            environments,
            services,
        })
    }

    pub async fn setup_environment(&self, name: String) -> Result<SetupResponse, GatewayError> {
        let report = self.with_provisioner(move |p| p.ensure_environment(&name)).await?;
        let message = if report.ready {
            format!("environment {} is ready", report.name)
        } else {
            format!(
                "environment {} is not ready ({} problem(s))",
                report.name,
                report.diagnostics.len().max(1)
            )
        };
        Ok(SetupResponse {
            success: report.ready,
            message,
            report,
        })
    }

    /// Readiness check without provisioning.
    pub async fn activate_environment(&self, name: String) -> Result<ActivateResponse, GatewayError> {
        let label = name.clone();
        let state = self.with_provisioner(move |p| p.status(&name)).await?;

        let (success, message) = if !state.exists {
            (false, format!("environment {label} has not been created"))
        } else if !state.packages_complete {
            let missing: Vec<&str> = state
                .missing
                .manager
                .iter()
                .chain(&state.missing.dependency)
                .map(String::as_str)
                .collect();
            (
                false,
                format!("environment {label} is missing packages: {}", missing.join(", ")),
            )
        } else {
            (true, format!("environment {label} is ready"))
        };

        Ok(ActivateResponse {
            success,
            needs_setup: !success,
            message,
        })
    }

    async fn service_status(&self, worker: &WorkerDescriptor) -> ServiceStatus {
        let health = self.health.check_health(&worker.base_url).await;
        ServiceStatus {
            running: health.healthy,
            url: worker.base_url.clone(),
            info: health.info,
            checked_at: health.checked_at,
        }
    }

    async fn require_ready(&self, worker: &WorkerDescriptor) -> Result<(), GatewayError> {
        if !self.require_environments {
            return Ok(());
        }
        let Some(environment) = worker.environment.clone() else {
            return Ok(());
        };

        let name = environment.clone();
        if self.with_provisioner(move |p| p.is_ready(&name)).await? {
            Ok(())
        } else {
            Err(GatewayError::ServiceUnavailable(format!(
                "environment {environment} is not ready; run setup first"
            )))
        }
    }

    async fn invalidate_matcher(&self) {
        let url = format!("{}/reload-dataset", self.matcher.base_url);
        let body = json!({});
        let call = tokio::time::timeout(self.invalidate_timeout, self.transport.post_json(&url, &body));
        match call.await {
            Ok(Ok(reply)) if reply.is_success() => {
                tracing::info!(persons = %reply.body["personsCount"], "matching worker cache invalidated");
            }
            Ok(Ok(reply)) => {
                tracing::warn!(status = reply.status, "cache invalidation rejected; relying on TTL");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cache invalidation failed; relying on TTL");
            }
            Err(_) => {
                tracing::warn!("cache invalidation timed out; relying on TTL");
            }
        }
    }

    /// Run a provisioner call on the blocking pool.
    async fn with_provisioner<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Provisioner) -> Result<T, ProvisionError> + Send + 'static,
        T: Send + 'static,
    {
        let provisioner = self.provisioner.clone();
        tokio::task::spawn_blocking(move || f(&provisioner))
            .await
            .map_err(join_error)?
            .map_err(|e| match e {
                ProvisionError::UnknownEnvironment(_) => GatewayError::Validation(e.to_string()),
            })
    }
}

fn validate_image(payload: &str) -> Result<(), GatewayError> {
    decode_image_payload(payload)
        .map(drop)
        .map_err(|e| GatewayError::Validation(e.to_string()))
}

fn dataset_error(error: DatasetError) -> GatewayError {
    match error {
        DatasetError::InvalidName(_) | DatasetError::InvalidImage(_) => {
            GatewayError::Validation(error.to_string())
        }
        DatasetError::Io { action, ref source } => {
            tracing::error!(action, error = %source, "dataset operation failed");
            GatewayError::Unknown(format!("dataset I/O failed while {action}"))
        }
    }
}

fn join_error(error: tokio::task::JoinError) -> GatewayError {
    tracing::error!(error = %error, "blocking task failed");
    GatewayError::Unknown("internal task failed".to_string())
}
