//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the 640x640 model input, decodes the three
//! anchor-free stride heads and applies non-maximum suppression.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the resized image inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let letterbox = Self {
            scale,
            offset_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            offset_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model input space back to source image space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Raw head outputs for one stride.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

/// Output tensor positions for one stride: (score, bbox, kps).
type HeadIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = head_indices(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?heads, "loaded SCRFD model");

        Ok(Self { session, heads })
    }

    /// Detect faces in an RGB image, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.heads[slot];
            let extract = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                keypoints: extract(kps_idx, "keypoints")?,
            };
            candidates.extend(decode_head(&head, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(non_max_suppression(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox the image into a normalized NCHW RGB tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height());
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.offset_x) as usize;
        let ty = (y + letterbox.offset_y) as usize;
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = (pixel[channel] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output names to stride heads.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// generic numeric names, in which case the conventional positional layout
/// applies: scores 0-2, boxes 3-5, keypoints 6-8.
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (
            position("score", stride),
            position("bbox", stride),
            position("kps", stride),
        ) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    named
}

fn decode_head(head: &StrideHead<'_>, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
    let cells_per_row = SCRFD_INPUT_SIZE as usize / head.stride;
    let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let step = head.stride as f32;

    let mut faces = Vec::new();
    for anchor in 0..anchors.min(head.scores.len()) {
        let score = head.scores[anchor];
        if score <= threshold {
            continue;
        }
        let Some(dist) = head.boxes.get(anchor * 4..anchor * 4 + 4) else {
            continue;
        };

        let cell = anchor / SCRFD_ANCHORS_PER_CELL;
        let cx = (cell % cells_per_row) as f32 * step;
        let cy = (cell / cells_per_row) as f32 * step;

        let (x1, y1) = letterbox.unmap(cx - dist[0] * step, cy - dist[1] * step);
        let (x2, y2) = letterbox.unmap(cx + dist[2] * step, cy + dist[3] * step);

        let landmarks = head.keypoints.get(anchor * 10..anchor * 10 + 10).map(|kps| {
            std::array::from_fn(|i| letterbox.unmap(cx + kps[i * 2] * step, cy + kps[i * 2 + 1] * step))
        });

        faces.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    faces
}

/// Greedy NMS; the result is sorted by descending confidence.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
