//! eduface-core: face detection, recognition and attribute analysis engine.
//!
//! Uses SCRFD for face detection, ArcFace for face recognition and optional
//! gender/age, emotion and race classifiers, all running via ONNX Runtime
//! for CPU inference. The HTTP daemon reaches all of it through
//! [`FaceBackend`] and the operations in [`analysis`] and [`identify`].

pub mod alignment;
pub mod analysis;
pub mod attributes;
pub mod backend;
pub mod detector;
pub mod facedb;
pub mod identify;
pub mod image_io;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use analysis::{AnalysisError, AnalyzeOptions, Action, FaceAttributes, IdentityMatch, MatchOptions, VerifyResult};
pub use backend::{BackendError, FaceBackend, ModelStatus, OnnxBackend};
pub use facedb::{DatabaseError, FaceDatabase, ReferenceImage};
pub use identify::{Identification, UnknownReason};
pub use image_io::{decode_image, ImageError};
pub use types::{BoundingBox, DetectorBackend, DistanceMetric, Embedding, FacialArea};

/// System-wide model directory used when `EDUFACE_MODEL_DIR` is not set.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/eduface/models")
}
