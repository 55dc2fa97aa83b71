use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

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
    /// A box covering the whole image, used when detection is skipped.
    pub fn whole_image(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 0.0,
            landmarks: None,
        }
    }

    /// Clamp the box to the image bounds and round to integer pixels.
    pub fn to_facial_area(&self, image_width: u32, image_height: u32) -> FacialArea {
        let x0 = self.x.max(0.0).min(image_width as f32);
        let y0 = self.y.max(0.0).min(image_height as f32);
        let x1 = (self.x + self.width).max(0.0).min(image_width as f32);
        let y1 = (self.y + self.height).max(0.0).min(image_height as f32);

        let point = |(px, py): (f32, f32)| (px.round() as i32, py.round() as i32);

        FacialArea {
            x: x0.round() as u32,
            y: y0.round() as u32,
            w: (x1 - x0).round() as u32,
            h: (y1 - y0).round() as u32,
            left_eye: self.landmarks.map(|l| point(l[0])),
            right_eye: self.landmarks.map(|l| point(l[1])),
        }
    }
}

/// Face region as reported to API callers, in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub left_eye: Option<(i32, i32)>,
    pub right_eye: Option<(i32, i32)>,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
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

    /// Euclidean distance after L2-normalizing both vectors.
    pub fn euclidean_l2_distance(&self, other: &Embedding) -> f32 {
        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let na = norm(&self.values);
        let nb = norm(&other.values);

        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let a = if na > 0.0 { a / na } else { 0.0 };
                let b = if nb > 0.0 { b / nb } else { 0.0 };
                (a - b).powi(2)
            })
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under the given metric. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self.euclidean_l2_distance(other),
        }
    }
}

/// How two embeddings are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::EuclideanL2 => "euclidean_l2",
        }
    }

    /// Verification threshold for ArcFace embeddings under this metric.
    ///
    /// Embeddings are unit length, so the two Euclidean metrics share a value.
    pub fn default_threshold(&self) -> f32 {
        match self {
            Self::Cosine => 0.68,
            Self::Euclidean | Self::EuclideanL2 => 1.13,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" => Ok(Self::Euclidean),
            "euclidean_l2" => Ok(Self::EuclideanL2),
            other => Err(format!(
                "unsupported distance metric '{other}' (expected cosine, euclidean or euclidean_l2)"
            )),
        }
    }
}

/// Where faces come from before embedding or classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBackend {
    /// SCRFD detection with landmarks.
    #[default]
    Scrfd,
    /// No detection: the whole image is treated as one face.
    Skip,
}

impl DetectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrfd => "scrfd",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Ok(Self::Scrfd),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unsupported detector backend '{other}' (expected scrfd or skip)"
            )),
        }
    }
}
