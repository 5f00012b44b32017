use serde::{Deserialize, Serialize};

use crate::wire::FaceLocation;

/// Distance tolerance for 128-d dlib-style encodings.
///
/// A standalone webcam variant of the matcher historically used 0.6; callers
/// that need that behaviour construct their own [`EuclideanMatcher`].
pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// Distance tolerance for L2-normalized ArcFace embeddings.
///
/// Unit vectors satisfy `d = sqrt(2 - 2cos)`, so this is the cut at cosine
/// similarity 0.40.
pub const ARCFACE_TOLERANCE: f32 = 1.095;

/// Name reported for a face that matched no identity.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Convert to integer `top/right/bottom/left` pixel coordinates clamped to the image.
    pub fn to_location(&self, image_width: u32, image_height: u32) -> FaceLocation {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as i32;
        FaceLocation {
            top: clamp(self.y, image_height),
            right: clamp(self.x + self.width, image_width),
            bottom: clamp(self.y + self.height, image_height),
            left: clamp(self.x, image_width),
        }
    }
}

/// Face encoding vector produced by a [`FaceEncoder`](crate::FaceEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension (e.g. produced by different models)
    /// are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise arithmetic mean.
    ///
    /// Returns `None` for an empty slice or when dimensions disagree.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let dim = first.values.len();
        if embeddings.iter().any(|e| e.values.len() != dim) {
            return None;
        }

        let mut sums = vec![0.0f64; dim];
        for embedding in embeddings {
            for (sum, v) in sums.iter_mut().zip(&embedding.values) {
                *sum += f64::from(*v);
            }
        }
        let count = embeddings.len() as f64;

        Some(Embedding {
            values: sums.into_iter().map(|s| (s / count) as f32).collect(),
            model_version: first.model_version.clone(),
        })
    }
}

/// One identity's aggregate encoding as held by the cache.
#[derive(Debug, Clone)]
pub struct IdentityEncoding {
    pub name: String,
    pub embedding: Embedding,
    /// Number of images that contributed to the mean.
    pub samples: usize,
}

/// Result of matching a probe embedding against the cached identities.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, `None` when nothing was within tolerance.
    pub name: Option<String>,
    /// Distance to the nearest identity, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// `(1 - distance) * 100` for accepted matches, 0 otherwise.
    pub confidence: f32,
}

impl MatchResult {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }
}

/// Strategy for comparing a probe embedding against a gallery of identities.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[IdentityEncoding]) -> MatchResult;
}

/// Nearest-neighbor matcher over Euclidean distance.
///
/// Ties resolve to the first identity in gallery order.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[IdentityEncoding]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&identity.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < self.tolerance => MatchResult {
                name: Some(gallery[idx].name.clone()),
                distance: Some(distance),
                confidence: confidence_for(distance),
            },
            other => MatchResult {
                name: None,
                distance: other.map(|(_, d)| d),
                confidence: 0.0,
            },
        }
    }
}

/// Percentage confidence for a distance, never negative, rounded to 2 decimals.
pub fn confidence_for(distance: f32) -> f32 {
    let raw = ((1.0 - distance) * 100.0).max(0.0);
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, values: Vec<f32>) -> IdentityEncoding {
        IdentityEncoding {
            name: name.into(),
            embedding: Embedding::new(values),
            samples: 1,
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_infinitely_far() {
        let short = Embedding::new(vec![0.1, 0.2]);
        let long = Embedding::new(vec![0.1, 0.2, 0.9]);
        assert_eq!(short.euclidean_distance(&long), f32::INFINITY);
        assert_eq!(long.euclidean_distance(&short), f32::INFINITY);
    }

    #[test]
    fn test_stale_model_identity_never_matches() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            identity("old-model", vec![1.0, 0.0]),
            identity("bob", vec![0.0, 0.0, 1.0]),
        ];
        let result = EuclideanMatcher::new(ARCFACE_TOLERANCE).best_match(&probe, &gallery);
        assert!(result.name.is_none());
        assert!((result.distance.unwrap() - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_arcface_tolerance_on_unit_vectors() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        // cos 0.6, d = sqrt(0.8)
        let gallery = vec![identity("alice", vec![0.6, 0.8])];
        let result = EuclideanMatcher::new(ARCFACE_TOLERANCE).best_match(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert!((result.confidence - 10.56).abs() < 0.01);

        let rejected = EuclideanMatcher::new(DEFAULT_TOLERANCE).best_match(&probe, &gallery);
        assert!(rejected.name.is_none());

        // cos 0.3, d = sqrt(1.4)
        let far = vec![identity("carol", vec![0.3, 0.91f32.sqrt()])];
        assert!(EuclideanMatcher::new(ARCFACE_TOLERANCE)
            .best_match(&probe, &far)
            .name
            .is_none());
    }

    #[test]
    fn test_mean_of_embeddings() {
        let mean = Embedding::mean(&[
            Embedding::new(vec![1.0, 2.0]),
            Embedding::new(vec![3.0, 6.0]),
        ])
        .unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_rejects_empty_and_mismatched() {
        assert!(Embedding::mean(&[]).is_none());
        assert!(Embedding::mean(&[
            Embedding::new(vec![1.0]),
            Embedding::new(vec![1.0, 2.0]),
        ])
        .is_none());
    }

    #[test]
    fn test_identical_probe_is_full_confidence() {
        let gallery = vec![identity("alice", vec![0.1, 0.2, 0.3])];
        let probe = Embedding::new(vec![0.1, 0.2, 0.3]);
        let result = EuclideanMatcher::new(DEFAULT_TOLERANCE).best_match(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.confidence, 100.0);
    }

    #[test]
    fn test_far_probe_is_unknown_with_zero_confidence() {
        let gallery = vec![identity("alice", vec![0.0, 0.0])];
        let probe = Embedding::new(vec![3.0, 4.0]);
        let result = EuclideanMatcher::new(DEFAULT_TOLERANCE).best_match(&probe, &gallery);
        assert!(result.name.is_none());
        assert_eq!(result.display_name(), UNKNOWN_IDENTITY);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.distance, Some(5.0));
    }

    #[test]
    fn test_distance_at_tolerance_is_rejected() {
        let gallery = vec![identity("alice", vec![0.0])];
        let probe = Embedding::new(vec![0.5]);
        let result = EuclideanMatcher::new(0.5).best_match(&probe, &gallery);
        assert!(result.name.is_none());
    }

    #[test]
    fn test_nearest_identity_wins() {
        let gallery = vec![
            identity("alice", vec![1.0, 0.0]),
            identity("bob", vec![0.0, 0.0]),
            identity("carol", vec![0.0, 1.0]),
        ];
        let probe = Embedding::new(vec![0.1, 0.0]);
        let result = EuclideanMatcher::new(0.5).best_match(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("bob"));
        assert_eq!(result.confidence, 90.0);
    }

    #[test]
    fn test_tie_goes_to_first_identity() {
        let gallery = vec![
            identity("alice", vec![0.2]),
            identity("bob", vec![-0.2]),
        ];
        let probe = Embedding::new(vec![0.0]);
        let result = EuclideanMatcher::new(0.5).best_match(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_empty_gallery() {
        let probe = Embedding::new(vec![1.0]);
        let result = EuclideanMatcher::new(0.5).best_match(&probe, &[]);
        assert!(result.name.is_none());
        assert!(result.distance.is_none());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_confidence_clamps_large_distance() {
        assert_eq!(confidence_for(1.7), 0.0);
        assert_eq!(confidence_for(0.25), 75.0);
    }

    #[test]
    fn test_bounding_box_to_location_clamps() {
        let bbox = BoundingBox {
            x: -3.2,
            y: 10.4,
            width: 50.0,
            height: 200.0,
            confidence: 0.9,
            landmarks: None,
        };
        let loc = bbox.to_location(40, 100);
        assert_eq!(loc.left, 0);
        assert_eq!(loc.top, 10);
        assert_eq!(loc.right, 40);
        assert_eq!(loc.bottom, 100);
    }
}
