//! Facial attribute classifiers via ONNX Runtime.
//!
//! - InsightFace `genderage.onnx`: gender scores and apparent age.
//! - FER+ `emotion-ferplus-8.onnx`: eight emotion classes from a 64x64 grayscale crop.
//! - `race.onnx`: six-class race classifier over a 224x224 RGB crop.
//!
//! All three are optional; the backend reports them unavailable when the file is missing.
//! genderage and FER+ emit raw scores; the race network emits probabilities.

use crate::alignment;
use crate::types::BoundingBox;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: u32 = 96;
const GENDERAGE_CROP_MARGIN: f32 = 1.5;
const EMOTION_INPUT_SIZE: u32 = 64;
const RACE_INPUT_SIZE: u32 = 224;

/// Gender labels in model output order (index 0 = female).
pub const GENDER_LABELS: [&str; 2] = ["Woman", "Man"];

/// FER+ output order.
pub const EMOTION_LABELS: [&str; 8] = [
    "neutral", "happy", "surprise", "sad", "angry", "disgust", "fear", "contempt",
];

pub const RACE_LABELS: [&str; 6] = [
    "asian", "indian", "black", "white", "middle eastern", "latino hispanic",
];

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("{model}: inference failed: {reason}")]
    InferenceFailed { model: &'static str, reason: String },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-class percentages, keyed by label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ClassScores(BTreeMap<String, f32>);

impl ClassScores {
    /// Percentages from raw scores, softmaxed.
    pub fn from_logits(labels: &[&str], logits: &[f32]) -> Self {
        Self::from_probabilities(labels, &softmax(logits))
    }

    /// Percentages from outputs that are already a distribution.
    pub fn from_probabilities(labels: &[&str], probs: &[f32]) -> Self {
        Self(
            labels
                .iter()
                .zip(probs)
                .map(|(label, p)| (label.to_string(), p * 100.0))
                .collect(),
        )
    }

    /// Label with the highest score.
    pub fn dominant(&self) -> Option<&str> {
        self.0
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(label, _)| label.as_str())
    }
}

fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    if total > 0.0 {
        exps.iter().map(|e| e / total).collect()
    } else {
        vec![0.0; values.len()]
    }
}

/// Gender scores and apparent age for one face.
#[derive(Debug, Clone)]
pub struct GenderAge {
    pub age: u32,
    pub gender: ClassScores,
}

/// An ONNX classification session with a single image input and output.
struct Classifier {
    session: Session,
    name: &'static str,
}

impl Classifier {
    fn load(model_path: &Path, intra_threads: usize, name: &'static str) -> Result<Self, AttributeError> {
        if !model_path.exists() {
            return Err(AttributeError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = name,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded attribute model"
        );

        Ok(Self { session, name })
    }

    fn run(&mut self, input: Array4<f32>, min_outputs: usize) -> Result<Vec<f32>, AttributeError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed { model: self.name, reason: e.to_string() })?;

        if data.len() < min_outputs {
            return Err(AttributeError::InferenceFailed {
                model: self.name,
                reason: format!("expected at least {min_outputs} outputs, got {}", data.len()),
            });
        }
        Ok(data.to_vec())
    }
}

/// InsightFace gender/age model.
pub struct GenderAgeModel(Classifier);

impl GenderAgeModel {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, AttributeError> {
        Classifier::load(model_path, intra_threads, "genderage").map(Self)
    }

    pub fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<GenderAge, AttributeError> {
        let crop = alignment::crop_centered(image, face, GENDERAGE_CROP_MARGIN, GENDERAGE_INPUT_SIZE);
        // The model normalizes internally: raw pixel values in.
        let out = self.0.run(rgb_tensor(&crop, 0.0, 1.0), 3)?;
        Ok(GenderAge {
            age: (out[2] * 100.0).round().max(0.0) as u32,
            gender: ClassScores::from_logits(&GENDER_LABELS, &out[..2]),
        })
    }
}

/// FER+ emotion model.
pub struct EmotionModel(Classifier);

impl EmotionModel {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, AttributeError> {
        Classifier::load(model_path, intra_threads, "emotion").map(Self)
    }

    pub fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, AttributeError> {
        let crop = alignment::crop_resized(image, face, EMOTION_INPUT_SIZE, EMOTION_INPUT_SIZE);
        let out = self.0.run(gray_tensor(&crop), EMOTION_LABELS.len())?;
        Ok(ClassScores::from_logits(&EMOTION_LABELS, &out[..EMOTION_LABELS.len()]))
    }
}

/// Race classifier.
pub struct RaceModel(Classifier);

impl RaceModel {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, AttributeError> {
        Classifier::load(model_path, intra_threads, "race").map(Self)
    }

    pub fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, AttributeError> {
        let crop = alignment::crop_resized(image, face, RACE_INPUT_SIZE, RACE_INPUT_SIZE);
        let out = self.0.run(rgb_tensor(&crop, 0.0, 255.0), RACE_LABELS.len())?;
        // The race network ends in a softmax layer.
        Ok(ClassScores::from_probabilities(&RACE_LABELS, &out[..RACE_LABELS.len()]))
    }
}

/// NCHW RGB tensor with `(p - mean) / std` normalization.
fn rgb_tensor(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Single-channel NCHW tensor of raw luma values.
fn gray_tensor(image: &RgbImage) -> Array4<f32> {
    let gray = imageops::grayscale(image);
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 1, h, w));
    for (x, y, pixel) in gray.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
    }
    tensor
}
