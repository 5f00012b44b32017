//! JSON request/response schemas shared by the gateway, the workers and the CLI.
//!
//! All bodies use camelCase keys. Requests reject unknown fields.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload is not valid base64")]
    InvalidBase64,
}

/// Request body ceiling for endpoints carrying an `image` payload.
///
/// Base64 inflates by a third, so a 24 MiB photo still fits.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Decode a base64 image payload, stripping an optional data-URL header.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, PayloadError> {
    let data = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let data = data.trim();
    if data.is_empty() {
        return Err(PayloadError::Empty);
    }
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|_| PayloadError::InvalidBase64)
}

/// Encode raw image bytes for an `image` field.
pub fn encode_image_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Body of `/recognize` and `/analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRequest {
    pub image: String,
}

/// Body of `/api/face-recognition/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    /// Number of images stored for the identity after this registration.
    pub count: usize,
}

/// Pixel coordinates of a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedFace {
    pub name: String,
    pub confidence: f32,
    pub location: FaceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeResponse {
    pub success: bool,
    pub faces: Vec<RecognizedFace>,
    pub total_faces: usize,
    pub processing_time_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub success: bool,
    pub persons_count: usize,
}

/// Success body of the analysis worker's `/analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub success: bool,
    pub age: u32,
    pub gender: String,
    pub gender_confidence: f32,
    pub emotion: String,
    pub emotion_confidence: f32,
    pub race: String,
    pub race_confidence: f32,
    #[serde(default)]
    pub all_emotions: BTreeMap<String, f32>,
    #[serde(default)]
    pub all_races: BTreeMap<String, f32>,
    pub total_faces: usize,
    pub processing_time_seconds: f64,
}

/// Body of every worker's `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub service_identity: String,
    #[serde(default)]
    pub readiness_flags: BTreeMap<String, serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUser {
    pub name: String,
    pub image_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersResponse {
    pub success: bool,
    pub users: Vec<RegisteredUser>,
}

/// Uniform error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
