//! facegate-core: identity dataset, encoding cache and face matching.
//!
//! The matching worker owns an [`EncodingCache`] built from a [`DatasetStore`]
//! through any [`FaceEncoder`]. The bundled encoder runs SCRFD detection and
//! ArcFace embedding via ONNX Runtime on the CPU.

pub mod alignment;
pub mod cache;
pub mod dataset;
pub mod detector;
pub mod encoder;
pub mod recognizer;
pub mod types;
pub mod wire;

pub use cache::{CacheSnapshot, EncodingCache};
pub use dataset::{DatasetError, DatasetStore, IdentityRecord};
pub use encoder::{EncodeError, EncodedFace, FaceEncoder, OnnxFaceEncoder};
pub use types::{
    BoundingBox, Embedding, EuclideanMatcher, IdentityEncoding, MatchResult, Matcher,
    ARCFACE_TOLERANCE, DEFAULT_TOLERANCE, UNKNOWN_IDENTITY,
};

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}
