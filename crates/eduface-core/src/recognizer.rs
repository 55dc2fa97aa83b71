//! ArcFace (insightface w600k_r50) embeddings via ONNX Runtime.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// ArcFace normalizes symmetrically: `(p - 127.5) / 127.5` maps into [-1, 1].
const PIXEL_CENTER: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download w600k_r50.onnx from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Unit-length embedding of one face.
    ///
    /// Landmarked faces are aligned onto the ArcFace template; a bare box
    /// (detection skipped or relaxed) is cropped and stretched to 112x112.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = match &face.landmarks {
            Some(points) => alignment::align_face(image, points),
            None => alignment::crop_resized(image, face, ALIGNED_SIZE, ALIGNED_SIZE),
        };

        let input = to_input(&crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "embedding has {} values, expected {EMBEDDING_DIM}",
                raw.len()
            )));
        }

        Ok(Embedding { values: unit_length(raw) })
    }
}

fn to_input(crop: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        match crop.get_pixel_checked(x as u32, y as u32) {
            Some(pixel) => (pixel[c] as f32 - PIXEL_CENTER) / PIXEL_CENTER,
            None => 0.0,
        }
    })
}

fn unit_length(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|v| v / norm).collect()
}
