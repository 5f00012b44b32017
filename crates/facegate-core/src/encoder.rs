//! The face-encoding capability: image in, located encodings out.

use std::sync::{Mutex, PoisonError};

use image::RgbImage;
use thiserror::Error;

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, ARCFACE_TOLERANCE, DEFAULT_TOLERANCE};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One detected face and its encoding.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Produces fixed-length encodings for every face found in an image.
///
/// Faces are returned in detection order (most confident first for the
/// bundled encoder). An image without faces yields an empty vector.
pub trait FaceEncoder: Send + Sync {
    fn encode_faces(&self, image: &RgbImage) -> Result<Vec<EncodedFace>, EncodeError>;

    /// Euclidean match tolerance on this encoder's embedding scale.
    fn recommended_tolerance(&self) -> f32 {
        DEFAULT_TOLERANCE
    }
}

/// SCRFD detection followed by landmark alignment and ArcFace embedding.
///
/// ONNX sessions need exclusive access while running, so each model sits
/// behind its own mutex.
pub struct OnnxFaceEncoder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxFaceEncoder {
    /// Load both models, failing fast if either is missing.
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EncodeError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");
        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode_faces(&self, image: &RgbImage) -> Result<Vec<EncodedFace>, EncodeError> {
        let faces = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(image)?;

        let mut encoded = Vec::with_capacity(faces.len());
        for bbox in faces {
            let Some(landmarks) = bbox.landmarks else {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                continue;
            };
            let aligned = alignment::align_face(image, &landmarks);
            let embedding = self
                .recognizer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .embed(&aligned)?;
            encoded.push(EncodedFace { bbox, embedding });
        }
        Ok(encoded)
    }

    fn recommended_tolerance(&self) -> f32 {
        ARCFACE_TOLERANCE
    }
}
