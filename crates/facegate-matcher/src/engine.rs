use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use facegate_core::wire::{
    decode_image_payload, HealthReport, PayloadError, RecognizeResponse, RecognizedFace,
};
use facegate_core::{
    DatasetError, EncodeError, EncodingCache, EuclideanMatcher, FaceEncoder, Matcher,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Payload(#[from] PayloadError),
    #[error("image could not be decoded: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("no registered faces; register at least one person first")]
    EmptyDataset,
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("face encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("dataset scan failed: {0}")]
    Dataset(#[from] DatasetError),
    #[error("engine task failed")]
    TaskFailed,
}

/// Recognition over the shared encoding cache.
///
/// Decoding, encoding and cache rebuilds are CPU-bound and run on the
/// blocking pool.
#[derive(Clone)]
pub struct Engine {
    encoder: Arc<dyn FaceEncoder>,
    cache: Arc<EncodingCache>,
    matcher: EuclideanMatcher,
}

impl Engine {
    pub fn new(encoder: Arc<dyn FaceEncoder>, cache: Arc<EncodingCache>, tolerance: f32) -> Self {
        Self {
            encoder,
            cache,
            matcher: EuclideanMatcher::new(tolerance),
        }
    }

    /// Identify every face in a base64 image payload.
    pub async fn recognize(&self, payload: String) -> Result<RecognizeResponse, EngineError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.recognize_blocking(&payload))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "recognition task failed");
                EngineError::TaskFailed
            })?
    }

    fn recognize_blocking(&self, payload: &str) -> Result<RecognizeResponse, EngineError> {
        let started = Instant::now();
        let bytes = decode_image_payload(payload)?;
        let image = image::load_from_memory(&bytes)?.to_rgb8();

        let snapshot = self.cache.snapshot();
        if snapshot.is_empty() {
            return Err(EngineError::EmptyDataset);
        }

        let faces = self.encoder.encode_faces(&image)?;
        if faces.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        let (width, height) = image.dimensions();
        let recognized: Vec<RecognizedFace> = faces
            .iter()
            .map(|face| {
                let result = self.matcher.best_match(&face.embedding, snapshot.identities());
                RecognizedFace {
                    name: result.display_name().to_string(),
                    confidence: result.confidence,
                    location: face.bbox.to_location(width, height),
                }
            })
            .collect();

        tracing::info!(
            faces = recognized.len(),
            matched = recognized.iter().filter(|f| f.confidence > 0.0).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recognition complete"
        );

        Ok(RecognizeResponse {
            success: true,
            total_faces: recognized.len(),
            faces: recognized,
            processing_time_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Invalidate the cache and report how many identities hold samples.
    ///
    /// The rebuild itself is deferred to the next recognition.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        self.cache.invalidate();
        let cache = self.cache.clone();
        let records = tokio::task::spawn_blocking(move || cache.dataset().identities())
            .await
            .map_err(|_| EngineError::TaskFailed)??;
        Ok(records.iter().filter(|r| r.image_count() > 0).count())
    }

    /// Build the cache now rather than on the first request.
    pub async fn warm(&self) -> Result<usize, EngineError> {
        let cache = self.cache.clone();
        let snapshot = tokio::task::spawn_blocking(move || cache.snapshot())
            .await
            .map_err(|_| EngineError::TaskFailed)?;
        Ok(snapshot.persons_count())
    }

    /// Liveness report; never triggers a rebuild.
    pub fn health(&self) -> HealthReport {
        let snapshot = self.cache.peek();
        let readiness_flags = BTreeMap::from([
            ("datasetLoaded".to_string(), json!(snapshot.is_some())),
            (
                "personsCount".to_string(),
                json!(snapshot.as_ref().map_or(0, |s| s.persons_count())),
            ),
        ]);
        HealthReport {
            status: "healthy".to_string(),
            service_identity: "facegate-matcher".to_string(),
            readiness_flags,
            timestamp: snapshot.map(|s| s.built_at()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facegate_core::wire::encode_image_payload;
    use facegate_core::{BoundingBox, DatasetStore, EncodedFace, Embedding};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;

    /// One face per non-black pixel in the top row's first two columns,
    /// encoded as that pixel's color scaled to [0, 1].
    pub(crate) struct PixelEncoder;

    impl FaceEncoder for PixelEncoder {
        fn encode_faces(&self, image: &RgbImage) -> Result<Vec<EncodedFace>, EncodeError> {
            let faces = (0..2u32)
                .filter_map(|x| {
                    let p = image.get_pixel(x, 0);
                    (p.0 != [0, 0, 0]).then(|| EncodedFace {
                        bbox: BoundingBox {
                            x: x as f32 * 4.0,
                            y: 0.0,
                            width: 4.0,
                            height: 4.0,
                            confidence: 0.9,
                            landmarks: None,
                        },
                        embedding: Embedding::new(
                            p.0.iter().map(|&c| c as f32 / 255.0).collect(),
                        ),
                    })
                })
                .collect();
            Ok(faces)
        }
    }

    pub(crate) fn sample(first: [u8; 3], second: [u8; 3]) -> RgbImage {
        let mut image = RgbImage::from_pixel(8, 8, Rgb(first));
        image.put_pixel(1, 0, Rgb(second));
        image
    }

    pub(crate) fn write_sample(root: &Path, identity: &str, file: &str, image: &RgbImage) {
        let dir = root.join(identity);
        std::fs::create_dir_all(&dir).unwrap();
        image.save_with_format(dir.join(file), ImageFormat::Png).unwrap();
    }

    pub(crate) fn payload(image: &RgbImage) -> String {
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", encode_image_payload(bytes.get_ref()))
    }

    pub(crate) fn engine(root: &Path) -> Engine {
        let encoder: Arc<dyn FaceEncoder> = Arc::new(PixelEncoder);
        let cache = Arc::new(EncodingCache::new(
            DatasetStore::new(root),
            encoder.clone(),
            Duration::from_secs(300),
        ));
        Engine::new(encoder, cache, facegate_core::DEFAULT_TOLERANCE)
    }

    const RED: [u8; 3] = [255, 0, 0];
    const GREEN: [u8; 3] = [0, 255, 0];
    const BLACK: [u8; 3] = [0, 0, 0];

    #[tokio::test]
    async fn test_identical_probe_is_full_confidence() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample(RED, BLACK));
        let engine = engine(tmp.path());

        let response = engine.recognize(payload(&sample(RED, BLACK))).await.unwrap();
        assert_eq!(response.total_faces, 1);
        assert_eq!(response.faces[0].name, "alice");
        assert_eq!(response.faces[0].confidence, 100.0);
    }

    #[tokio::test]
    async fn test_faces_matched_independently_in_detection_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample(RED, BLACK));
        write_sample(tmp.path(), "bob", "img_0.png", &sample(GREEN, BLACK));
        let engine = engine(tmp.path());

        let response = engine.recognize(payload(&sample(GREEN, [0, 0, 255]))).await.unwrap();
        let names: Vec<_> = response.faces.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["bob", "Unknown"]);
        assert_eq!(response.faces[1].confidence, 0.0);
        assert_eq!(response.faces[1].location.left, 4);
    }

    #[tokio::test]
    async fn test_empty_dataset_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = engine(tmp.path())
            .recognize(payload(&sample(RED, BLACK)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyDataset));
    }

    #[tokio::test]
    async fn test_no_face_in_query() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample(RED, BLACK));
        let err = engine(tmp.path())
            .recognize(payload(&sample(BLACK, BLACK)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
    }

    #[tokio::test]
    async fn test_bad_payloads() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        assert!(matches!(
            engine.recognize(String::new()).await.unwrap_err(),
            EngineError::Payload(_)
        ));
        assert!(matches!(
            engine
                .recognize(encode_image_payload(b"not an image"))
                .await
                .unwrap_err(),
            EngineError::InvalidImage(_)
        ));
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_identity() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample(RED, BLACK));
        let engine = engine(tmp.path());
        assert_eq!(engine.warm().await.unwrap(), 1);

        write_sample(tmp.path(), "bob", "img_0.png", &sample(GREEN, BLACK));
        let probe = payload(&sample(GREEN, BLACK));
        assert_eq!(engine.recognize(probe.clone()).await.unwrap().faces[0].name, "Unknown");

        assert_eq!(engine.reload().await.unwrap(), 2);
        assert_eq!(engine.recognize(probe).await.unwrap().faces[0].name, "bob");
    }

    #[tokio::test]
    async fn test_health_reflects_cache_without_building() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "img_0.png", &sample(RED, BLACK));
        let engine = engine(tmp.path());

        let cold = engine.health();
        assert_eq!(cold.readiness_flags["datasetLoaded"], json!(false));
        assert!(cold.timestamp.is_none());

        engine.warm().await.unwrap();
        let warm = engine.health();
        assert_eq!(warm.readiness_flags["datasetLoaded"], json!(true));
        assert_eq!(warm.readiness_flags["personsCount"], json!(1));
        assert!(warm.timestamp.is_some());
    }
}
