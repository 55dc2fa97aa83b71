//! The face-analysis backend: one trait at the seam between the HTTP shell
//! and the ONNX models.

use crate::attributes::{AttributeError, ClassScores, EmotionModel, GenderAge, GenderAgeModel, RaceModel};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const GENDERAGE_MODEL_FILE: &str = "genderage.onnx";
pub const EMOTION_MODEL_FILE: &str = "emotion-ferplus-8.onnx";
pub const RACE_MODEL_FILE: &str = "race.onnx";

/// Name of the embedding model, as reported in results.
pub const RECOGNITION_MODEL_NAME: &str = "ArcFace";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attribute model error: {0}")]
    Attribute(#[from] AttributeError),
    #[error("{0} model is not loaded; place {1} in the model directory")]
    ModelUnavailable(&'static str, &'static str),
}

/// Which models a backend has available.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ModelStatus {
    pub detector: bool,
    pub recognizer: bool,
    pub gender_age: bool,
    pub emotion: bool,
    pub race: bool,
}

/// Face detection, embedding and attribute classification over decoded images.
///
/// Implementations own inference sessions and need exclusive access, so
/// every method takes `&mut self`.
pub trait FaceBackend {
    /// Detect faces, sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError>;

    /// Embedding for one face region of the image.
    fn represent(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, BackendError>;

    fn gender_age(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<GenderAge, BackendError>;

    fn emotion(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, BackendError>;

    fn race(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, BackendError>;

    fn status(&self) -> ModelStatus;
}

/// ONNX Runtime backend: SCRFD + ArcFace, with optional attribute models.
pub struct OnnxBackend {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    gender_age: Option<GenderAgeModel>,
    emotion: Option<EmotionModel>,
    race: Option<RaceModel>,
}

impl OnnxBackend {
    /// Load all models from `model_dir`.
    ///
    /// Detector and recognizer are required. Attribute models are loaded when
    /// their file exists; a missing file is logged and the model left out.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, BackendError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), intra_threads)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE), intra_threads)?;

        let gender_age = load_optional(model_dir, GENDERAGE_MODEL_FILE, |p| GenderAgeModel::load(p, intra_threads))?;
        let emotion = load_optional(model_dir, EMOTION_MODEL_FILE, |p| EmotionModel::load(p, intra_threads))?;
        let race = load_optional(model_dir, RACE_MODEL_FILE, |p| RaceModel::load(p, intra_threads))?;

        Ok(Self { detector, recognizer, gender_age, emotion, race })
    }
}

fn load_optional<T>(
    model_dir: &Path,
    file: &str,
    load: impl FnOnce(&Path) -> Result<T, AttributeError>,
) -> Result<Option<T>, BackendError> {
    let path: PathBuf = model_dir.join(file);
    if !path.exists() {
        tracing::warn!(path = %path.display(), "optional model not found; related analysis actions disabled");
        return Ok(None);
    }
    Ok(Some(load(&path)?))
}

impl FaceBackend for OnnxBackend {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError> {
        Ok(self.detector.detect(image)?)
    }

    fn represent(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, BackendError> {
        Ok(self.recognizer.extract(image, face)?)
    }

    fn gender_age(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<GenderAge, BackendError> {
        let model = self
            .gender_age
            .as_mut()
            .ok_or(BackendError::ModelUnavailable("gender/age", GENDERAGE_MODEL_FILE))?;
        Ok(model.predict(image, face)?)
    }

    fn emotion(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, BackendError> {
        let model = self
            .emotion
            .as_mut()
            .ok_or(BackendError::ModelUnavailable("emotion", EMOTION_MODEL_FILE))?;
        Ok(model.predict(image, face)?)
    }

    fn race(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<ClassScores, BackendError> {
        let model = self
            .race
            .as_mut()
            .ok_or(BackendError::ModelUnavailable("race", RACE_MODEL_FILE))?;
        Ok(model.predict(image, face)?)
    }

    fn status(&self) -> ModelStatus {
        ModelStatus {
            detector: true,
            recognizer: true,
            gender_age: self.gender_age.is_some(),
            emotion: self.emotion.is_some(),
            race: self.race.is_some(),
        }
    }
}
