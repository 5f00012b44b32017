use std::path::PathBuf;
use std::time::Duration;

use facegate_core::wire::DEFAULT_MAX_BODY_BYTES;
use facegate_core::FaceEncoder;

/// Matching worker configuration, loaded from environment variables.
pub struct Config {
    /// Listen address (default: 0.0.0.0:5001).
    pub bind: String,
    /// Root of the identity dataset.
    pub dataset_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Euclidean distance below which a face is accepted; `None` defers to
    /// the encoder's own scale.
    pub tolerance: Option<f32>,
    /// Lifetime of a built encoding cache.
    pub cache_ttl: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("FACEGATE_MATCHER_BIND")
                .unwrap_or_else(|_| "0.0.0.0:5001".to_string()),
            dataset_dir: std::env::var("FACEGATE_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dataset")),
            model_dir: std::env::var("FACEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| facegate_core::default_model_dir()),
            tolerance: std::env::var("FACEGATE_MATCH_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok()),
            cache_ttl: Duration::from_secs(env_u64("FACEGATE_CACHE_TTL_SECS", 300)),
            max_body_bytes: env_u64("FACEGATE_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES as u64)
                as usize,
        }
    }

    /// Match tolerance for `encoder`, unless overridden.
    pub fn tolerance_for(&self, encoder: &dyn FaceEncoder) -> f32 {
        self.tolerance
            .unwrap_or_else(|| encoder.recommended_tolerance())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
