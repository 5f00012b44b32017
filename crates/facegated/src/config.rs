use std::path::PathBuf;
use std::time::Duration;

use facegate_core::wire::DEFAULT_MAX_BODY_BYTES;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: String,
    /// Base URL of the matching worker.
    pub matcher_url: String,
    /// Base URL of the analysis worker.
    pub analyzer_url: String,
    /// Environment the matching worker runs in.
    pub matcher_environment: String,
    /// Environment the analysis worker runs in.
    pub analyzer_environment: String,
    /// Root of the identity dataset shared with the matching worker.
    pub dataset_dir: PathBuf,
    /// Budget for a worker `/health` probe.
    pub health_timeout: Duration,
    /// Budget for a forwarded request.
    pub request_timeout: Duration,
    /// Budget for the post-registration `/reload-dataset` call.
    pub invalidate_timeout: Duration,
    /// Environment manager executable.
    pub env_manager: String,
    /// Registry file replacing the embedded one.
    pub environments_file: Option<PathBuf>,
    /// Refuse registrations while the matcher environment is not ready.
    pub require_environments: bool,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            bind: env_string("FACEGATE_BIND", "0.0.0.0:5000"),
            matcher_url: trim_url(env_string("FACEGATE_MATCHER_URL", "http://localhost:5001")),
            analyzer_url: trim_url(env_string("FACEGATE_ANALYZER_URL", "http://localhost:5002")),
            matcher_environment: env_string("FACEGATE_MATCHER_ENV", "face_recognition"),
            analyzer_environment: env_string("FACEGATE_ANALYZER_ENV", "deepface_recognition"),
            dataset_dir: std::env::var("FACEGATE_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dataset")),
            health_timeout: Duration::from_millis(env_u64("FACEGATE_HEALTH_TIMEOUT_MS", 2000)),
            request_timeout: Duration::from_secs(env_u64("FACEGATE_REQUEST_TIMEOUT_SECS", 30)),
            invalidate_timeout: Duration::from_secs(env_u64("FACEGATE_INVALIDATE_TIMEOUT_SECS", 5)),
            env_manager: env_string("FACEGATE_ENV_MANAGER", "conda"),
            environments_file: std::env::var("FACEGATE_ENVIRONMENTS_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            require_environments: std::env::var("FACEGATE_REQUIRE_ENVIRONMENTS")
                .map(|v| v != "0")
                .unwrap_or(true),
            max_body_bytes: env_u64("FACEGATE_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES as u64)
                as usize,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
