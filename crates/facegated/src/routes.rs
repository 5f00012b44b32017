use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use facegate_core::wire::{HealthReport, ImageRequest, RegisterRequest, RegisterResponse, UsersResponse};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::gateway::{ActivateResponse, EnvironmentsOverview, Gateway, SetupResponse, WorkerDescriptor};
use crate::transport::WorkerReply;

pub fn router(gateway: Arc<Gateway>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/check-environments", get(check_environments))
        .route("/api/setup-environment/{name}", post(setup_environment))
        .route("/api/activate-environment/{name}", post(activate_environment))
        .route("/api/face-recognition/register", post(register))
        .route("/api/face-recognition/recognize", post(recognize))
        .route("/api/deepface/analyze", post(analyze))
        .route("/api/get-registered-users", get(registered_users))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<HealthReport> {
    let last_seen = |worker: &WorkerDescriptor| gateway.last_health(worker).map(|h| h.healthy);
    let readiness_flags = BTreeMap::from([
        ("matcherUrl".to_string(), json!(gateway.matcher().base_url)),
        ("analyzerUrl".to_string(), json!(gateway.analyzer().base_url)),
        ("matcherHealthy".to_string(), json!(last_seen(gateway.matcher()))),
        ("analyzerHealthy".to_string(), json!(last_seen(gateway.analyzer()))),
    ]);
    Json(HealthReport {
        status: "healthy".to_string(),
        service_identity: "facegated".to_string(),
        readiness_flags,
        timestamp: Some(Utc::now()),
    })
}

async fn check_environments(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<EnvironmentsOverview>, GatewayError> {
    Ok(Json(gateway.check_environments().await?))
}

async fn setup_environment(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Result<Json<SetupResponse>, GatewayError> {
    tracing::info!(environment = %name, "setup requested");
    Ok(Json(gateway.setup_environment(name).await?))
}

async fn activate_environment(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Result<Json<ActivateResponse>, GatewayError> {
    Ok(Json(gateway.activate_environment(name).await?))
}

async fn register(
    State(gateway): State<Arc<Gateway>>,
    request: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, GatewayError> {
    let Json(request) = request.map_err(rejection)?;
    Ok(Json(gateway.register(request).await?))
}

async fn recognize(
    State(gateway): State<Arc<Gateway>>,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), GatewayError> {
    let Json(request) = request.map_err(rejection)?;
    Ok(relay(gateway.recognize(request).await?))
}

async fn analyze(
    State(gateway): State<Arc<Gateway>>,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), GatewayError> {
    let Json(request) = request.map_err(rejection)?;
    Ok(relay(gateway.analyze(request).await?))
}

async fn registered_users(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<UsersResponse>, GatewayError> {
    Ok(Json(gateway.users().await?))
}

fn relay(reply: WorkerReply) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(reply.body))
}

fn rejection(rejection: JsonRejection) -> GatewayError {
    GatewayError::Validation(rejection.body_text())
}
