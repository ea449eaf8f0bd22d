//! Seam for the face-embedding provider.
//!
//! The matching engine never looks inside faces itself: it asks a
//! [`FaceEncoder`] where the faces are and what they look like as vectors.
//! Implementations may wrap dlib, an ONNX model, or a remote service; they are
//! called from a blocking thread, so they may be slow and synchronous.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("face encoder failed: {0}")]
    Failed(String),
    #[error("expected {expected} embeddings, encoder returned {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Face location and embedding provider.
pub trait FaceEncoder: Send + Sync {
    /// Find faces in `image`. An empty list means no faces.
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError>;

    /// Embed each face in `faces`, in the same order.
    fn embed(&self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError>;

    /// Locate and embed every face in `image`.
    fn encode(&self, image: &RgbImage) -> Result<Vec<(BoundingBox, Embedding)>, EncoderError> {
        let faces = self.locate(image)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self.embed(image, &faces)?;
        if embeddings.len() != faces.len() {
            return Err(EncoderError::CountMismatch {
                expected: faces.len(),
                actual: embeddings.len(),
            });
        }
        Ok(faces.into_iter().zip(embeddings).collect())
    }
}
