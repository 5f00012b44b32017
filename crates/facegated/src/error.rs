use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facegate_core::wire::ErrorBody;
use thiserror::Error;

/// Failures surfaced to gateway clients as `{success: false, error}`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    GatewayTimeout(String),
    #[error("{0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}
