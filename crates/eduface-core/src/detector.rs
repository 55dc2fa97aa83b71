//! SCRFD face detector via ONNX Runtime.
//!
//! The image is letterboxed into a 640x640 square, the network predicts per
//! anchor a score, box distances and five landmark offsets at strides 8, 16
//! and 32, and overlapping boxes are merged with greedy NMS.

use crate::types::BoundingBox;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download det_10g.onnx from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Where the three output tensors of one stride live in the session outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Placement of the source image inside the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self { scale, offset_x: (size - width) / 2, offset_y: (size - height) / 2, width, height }
    }

    /// Network-input coordinates back to source-image coordinates.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.offset_x as f32) / self.scale, (y - self.offset_y as f32) / self.scale)
    }

    /// Normalized NCHW tensor. Padding stays at zero, which is mid-grey after normalization.
    fn tensor(&self, image: &RgbImage, size: u32) -> Array4<f32> {
        let resized = imageops::resize(image, self.width, self.height, imageops::FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + self.offset_x) as usize, (y + self.offset_y) as usize);
            for (c, value) in pixel.0.iter().enumerate() {
                tensor[[0, c, ty, tx]] = (*value as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }
}

pub struct FaceDetector {
    session: Session,
    layout: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score, bbox and kps outputs for each of {} strides, model has {}",
                STRIDES.len(),
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self { session, layout })
    }

    /// Faces in the image, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_SIZE);
        let input = letterbox.tensor(image, INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |index: usize, what: &str, stride: usize| {
            outputs[index]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for level in &self.layout {
            let scores = extract(level.score, "scores", level.stride)?;
            let bboxes = extract(level.bbox, "boxes", level.stride)?;
            let kps = extract(level.kps, "landmarks", level.stride)?;
            candidates.extend(decode_level(scores, bboxes, kps, level.stride, &letterbox, SCORE_THRESHOLD));
        }

        let faces = suppress_overlaps(candidates, NMS_IOU_THRESHOLD);
        tracing::debug!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Map outputs by their exported names (`score_8`, `bbox_16`, `kps_32`, ...).
///
/// Exports with anonymous outputs use the insightface order: three score
/// tensors, then three box tensors, then three landmark tensors.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = |stride: usize| {
        Some(StrideOutputs {
            stride,
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    match (by_name(STRIDES[0]), by_name(STRIDES[1]), by_name(STRIDES[2])) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            let n = STRIDES.len();
            STRIDES.map(|stride| {
                let level = STRIDES.iter().position(|s| *s == stride).unwrap_or(0);
                StrideOutputs { stride, score: level, bbox: n + level, kps: 2 * n + level }
            })
        }
    }
}

/// Turn one stride's raw outputs into candidate boxes in source-image coordinates.
fn decode_level(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_per_row = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .take(cells_per_row * cells_per_row * ANCHORS_PER_CELL)
        .filter(|(_, score)| **score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * step;
            let cy = (cell / cells_per_row) as f32 * step;

            let d = bboxes.get(anchor * 4..anchor * 4 + 4)?;
            let (left, top) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (right, bottom) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(anchor * 10..anchor * 10 + 10).map(|offsets| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (point, pair) in points.iter_mut().zip(offsets.chunks_exact(2)) {
                    *point = letterbox.to_source(cx + pair[0] * step, cy + pair[1] * step);
                }
                points
            });

            Some(BoundingBox {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS: keep the most confident box of every overlapping cluster.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| overlap(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = iw * ih;
    let union = a.width * a.height + b.width * b.height - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: side, height: side, confidence, landmarks: None }
    }

    #[test]
    fn test_overlap() {
        let a = square(0.0, 0.0, 20.0, 1.0);
        assert!((overlap(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(overlap(&a, &square(40.0, 40.0, 20.0, 1.0)), 0.0);
        // 10x20 shared, union 400 + 400 - 200
        let shifted = square(10.0, 0.0, 20.0, 1.0);
        assert!((overlap(&a, &shifted) - 200.0 / 600.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps_keeps_best_of_cluster() {
        let faces = suppress_overlaps(
            vec![
                square(300.0, 300.0, 40.0, 0.6),
                square(2.0, 2.0, 80.0, 0.75),
                square(0.0, 0.0, 80.0, 0.95),
            ],
            NMS_IOU_THRESHOLD,
        );
        let confidences: Vec<f32> = faces.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.6]);
        assert!(suppress_overlaps(Vec::new(), NMS_IOU_THRESHOLD).is_empty());
    }

    #[test]
    fn test_letterbox_portrait() {
        // 100x200 scales by 3.2 to 320x640, centred with 160 columns each side.
        let letterbox = Letterbox::fit(100, 200, INPUT_SIZE);
        assert!((letterbox.scale - 3.2).abs() < 1e-6);
        assert_eq!((letterbox.width, letterbox.height), (320, 640));
        assert_eq!((letterbox.offset_x, letterbox.offset_y), (160, 0));

        let (x, y) = letterbox.to_source(480.0, 320.0);
        assert!((x - 100.0).abs() < 1e-4);
        assert!((y - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_tensor_padding() {
        let image = RgbImage::from_pixel(100, 200, Rgb([255, 0, 0]));
        let letterbox = Letterbox::fit(100, 200, INPUT_SIZE);
        let tensor = letterbox.tensor(&image, INPUT_SIZE);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 320, 10]], 0.0);
        let red = (255.0 - PIXEL_MEAN) / PIXEL_STD;
        assert!((tensor[[0, 0, 320, 320]] - red).abs() < 0.02);
        assert!((tensor[[0, 1, 320, 320]] + PIXEL_MEAN / PIXEL_STD).abs() < 0.02);
    }

    #[test]
    fn test_decode_level() {
        let letterbox = Letterbox::fit(100, 200, INPUT_SIZE);
        let stride = 16;
        let cells = 640 / stride;
        let anchors = cells * cells * ANCHORS_PER_CELL;

        let mut scores = vec![0.1f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let mut kps = vec![0.0f32; anchors * 10];

        // Second anchor of cell (col 20, row 10): centre (320, 160).
        let anchor = (10 * cells + 20) * ANCHORS_PER_CELL + 1;
        scores[anchor] = 0.8;
        bboxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[2.0, 2.0, 2.0, 2.0]);
        kps[anchor * 10] = -1.0;

        let faces = decode_level(&scores, &bboxes, &kps, stride, &letterbox, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        // Box 288..352 x 128..192 in input space, minus 160 px offset, over 3.2.
        assert!((face.x - 40.0).abs() < 1e-4);
        assert!((face.y - 40.0).abs() < 1e-4);
        assert!((face.width - 20.0).abs() < 1e-4);
        assert!((face.height - 20.0).abs() < 1e-4);
        let landmarks = face.landmarks.expect("landmarks");
        assert!((landmarks[0].0 - 45.0).abs() < 1e-4);
        assert!((landmarks[1].1 - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_level_tolerates_short_outputs() {
        let letterbox = Letterbox::fit(640, 640, INPUT_SIZE);
        let faces = decode_level(&[0.9, 0.9], &[1.0; 4], &[], 32, &letterbox, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        assert!(faces[0].landmarks.is_none());
    }

    #[test]
    fn test_output_layout_by_name() {
        let names: Vec<String> = ["kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let layout = output_layout(&names);
        assert_eq!(layout[0], StrideOutputs { stride: 8, score: 2, bbox: 1, kps: 0 });
        assert_eq!(layout[2], StrideOutputs { stride: 32, score: 8, bbox: 7, kps: 6 });
    }

    #[test]
    fn test_output_layout_positional() {
        let names: Vec<String> = (400..409).map(|i: usize| i.to_string()).collect();
        let layout = output_layout(&names);
        assert_eq!(layout[1], StrideOutputs { stride: 16, score: 1, bbox: 4, kps: 7 });
    }
}
