use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a located face, in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// A box covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to the image bounds.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);

        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// Copy the boxed region out of `image`.
    pub fn crop(&self, image: &RgbImage) -> Option<RgbImage> {
        let (x, y, w, h) = self.clamp(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
    }
}

/// Face embedding vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, if the encoder reports one.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A known identity's reference embedding, as offered to a [`Matcher`].
#[derive(Debug, Clone)]
pub struct Reference {
    pub person_id: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest reference (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// `1 - distance` for a match, clamped to `[0, 1]`; 0 otherwise.
    pub similarity: f32,
    /// Person of the matched reference (if any).
    pub person_id: Option<String>,
}

/// Strategy for comparing a probe embedding against a gallery of known faces.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[Reference], tolerance: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// A reference matches when its distance is strictly below the tolerance.
/// Among several matching references the closest wins; on equal distance the
/// earlier one in the gallery is kept.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Reference], tolerance: f32) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, reference) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&reference.embedding);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < tolerance => MatchResult {
                matched: true,
                distance: best_distance,
                similarity: (1.0 - best_distance).clamp(0.0, 1.0),
                person_id: Some(gallery[idx].person_id.clone()),
            },
            _ => MatchResult {
                matched: false,
                distance: best_distance,
                similarity: 0.0,
                person_id: None,
            },
        }
    }
}
