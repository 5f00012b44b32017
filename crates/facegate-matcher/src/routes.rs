use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facegate_core::wire::{ErrorBody, HealthReport, ImageRequest, RecognizeResponse, ReloadResponse};

use crate::engine::{Engine, EngineError};

pub fn router(engine: Engine, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/recognize", post(recognize))
        .route("/reload-dataset", post(reload_dataset))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(engine)
}

/// HTTP face of [`EngineError`].
struct ApiError(StatusCode, String);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Payload(_)
            | EngineError::InvalidImage(_)
            | EngineError::EmptyDataset
            | EngineError::NoFaceDetected => ApiError(StatusCode::BAD_REQUEST, error.to_string()),
            EngineError::Encode(ref e) => {
                tracing::error!(error = %e, "face encoding failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, "face encoding failed".to_string())
            }
            EngineError::Dataset(ref e) => {
                tracing::error!(error = %e, "dataset scan failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, "dataset scan failed".to_string())
            }
            EngineError::TaskFailed => {
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody::new(self.1))).into_response()
    }
}

async fn health(State(engine): State<Engine>) -> Json<HealthReport> {
    Json(engine.health())
}

async fn recognize(
    State(engine): State<Engine>,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let Json(request) = request.map_err(|r| ApiError(StatusCode::BAD_REQUEST, r.body_text()))?;
    Ok(Json(engine.recognize(request.image).await?))
}

async fn reload_dataset(State(engine): State<Engine>) -> Result<Json<ReloadResponse>, ApiError> {
    let persons_count = engine.reload().await?;
    tracing::info!(persons = persons_count, "dataset reload requested");
    Ok(Json(ReloadResponse {
        success: true,
        persons_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine, payload, sample, write_sample};
    use facegate_core::wire::encode_image_payload;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(root: &Path) -> Router {
        router(engine(root), facegate_core::wire::DEFAULT_MAX_BODY_BYTES)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_recognize_over_http() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample([255, 0, 0], [0, 0, 0]));
        let app = app(tmp.path());

        let (status, body) = send(
            app,
            "POST",
            "/recognize",
            Some(json!({ "image": payload(&sample([255, 0, 0], [0, 0, 0])) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["totalFaces"], 1);
        assert_eq!(body["faces"][0]["name"], "alice");
        assert_eq!(body["faces"][0]["location"]["left"], 0);
        assert!(body["processingTimeSeconds"].is_number());
    }

    #[tokio::test]
    async fn test_no_face_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample([255, 0, 0], [0, 0, 0]));
        let (status, body) = send(
            app(tmp.path()),
            "POST",
            "/recognize",
            Some(json!({ "image": payload(&sample([0, 0, 0], [0, 0, 0])) })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "success": false, "error": "no face detected in the image" }));
    }

    #[tokio::test]
    async fn test_missing_image_field_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = send(app(tmp.path()), "POST", "/recognize", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_reload_and_health() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample([255, 0, 0], [0, 0, 0]));
        std::fs::create_dir_all(tmp.path().join("empty")).unwrap();
        let app = app(tmp.path());

        let (status, body) = send(app.clone(), "POST", "/reload-dataset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "personsCount": 1 }));

        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["serviceIdentity"], "facegate-matcher");
        assert_eq!(body["readinessFlags"]["datasetLoaded"], false);
    }

    #[tokio::test]
    async fn test_multi_megabyte_photo_is_recognized() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample([255, 0, 0], [0, 0, 0]));

        // Noise defeats PNG compression so the body lands well past 2 MB.
        let mut state = 0x2545_f491_u32;
        let mut photo = RgbImage::from_fn(1200, 900, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = state.to_le_bytes();
            Rgb([r, g, b])
        });
        photo.put_pixel(0, 0, Rgb([255, 0, 0]));
        photo.put_pixel(1, 0, Rgb([0, 0, 0]));
        let mut bytes = Cursor::new(Vec::new());
        photo.write_to(&mut bytes, ImageFormat::Png).unwrap();
        let image = encode_image_payload(bytes.get_ref());
        assert!(image.len() > 2 * 1024 * 1024);

        let (status, body) = send(
            app(tmp.path()),
            "POST",
            "/recognize",
            Some(json!({ "image": image })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["faces"][0]["name"], "alice");
    }
}
