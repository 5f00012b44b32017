//! Face alignment via a least-squares similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout and
//! resamples the face into the 112x112 crop ArcFace expects.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for ((sx, sy), (dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-12 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Align a detected face to a canonical 112x112 RGB crop.
///
/// Degenerate landmarks (all coincident) fall back to a plain resize of the
/// whole image so the caller still gets a crop of the expected size.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let inverse = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)
        .and_then(|t| t.inverse());
    let Some(inverse) = inverse else {
        tracing::debug!("degenerate landmarks; resizing instead of aligning");
        return image::imageops::resize(
            image,
            ALIGNED_SIZE,
            ALIGNED_SIZE,
            image::imageops::FilterType::Triangle,
        );
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = inverse.apply((x as f32, y as f32));
        sample_bilinear(image, sx, sy)
    })
}

/// Bilinear sample; pixels outside the image read as black.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let texel = |px: f32, py: f32| -> [f32; 3] {
        if px < 0.0 || py < 0.0 || px >= image.width() as f32 || py >= image.height() as f32 {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let tl = texel(x0, y0);
    let tr = texel(x0 + 1.0, y0);
    let bl = texel(x0, y0 + 1.0);
    let br = texel(x0 + 1.0, y0 + 1.0);

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}
