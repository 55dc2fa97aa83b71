//! Verification, database search and attribute analysis over a [`FaceBackend`].

use crate::attributes::ClassScores;
use crate::backend::{BackendError, FaceBackend, RECOGNITION_MODEL_NAME};
use crate::facedb::{DatabaseError, FaceDatabase};
use crate::image_io;
use crate::types::{BoundingBox, DetectorBackend, DistanceMetric, Embedding, FacialArea};
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("face could not be detected in {0}; confirm it is a face photo or set enforce_detection=false")]
    NoFace(&'static str),
    #[error("no face could be represented in reference database {0}")]
    NoReferenceFaces(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Parameters shared by verification and search.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    pub detector_backend: DetectorBackend,
    pub distance_metric: DistanceMetric,
    /// Overrides the metric's default threshold.
    pub threshold: Option<f32>,
    pub enforce_detection: bool,
}

impl MatchOptions {
    pub fn effective_threshold(&self) -> f32 {
        self.threshold.unwrap_or_else(|| self.distance_metric.default_threshold())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FacialAreas {
    pub img1: FacialArea,
    pub img2: FacialArea,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub verified: bool,
    pub distance: f32,
    pub threshold: f32,
    pub model: &'static str,
    pub detector_backend: DetectorBackend,
    pub similarity_metric: DistanceMetric,
    pub facial_areas: FacialAreas,
    /// Seconds spent in the engine.
    pub time: f64,
}

/// One reference face within the search threshold.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityMatch {
    /// Path of the reference image.
    pub identity: String,
    pub person: String,
    pub distance: f32,
    pub threshold: f32,
    pub target_x: u32,
    pub target_y: u32,
    pub target_w: u32,
    pub target_h: u32,
    pub source_x: u32,
    pub source_y: u32,
    pub source_w: u32,
    pub source_h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Age,
    Gender,
    Emotion,
    Race,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Age, Action::Gender, Action::Emotion, Action::Race];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Gender => "gender",
            Self::Emotion => "emotion",
            Self::Race => "race",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(Self::Age),
            "gender" => Ok(Self::Gender),
            "emotion" => Ok(Self::Emotion),
            "race" => Ok(Self::Race),
            other => Err(format!(
                "invalid action '{other}' (expected age, gender, emotion or race)"
            )),
        }
    }
}

/// Parse action lists given as repeated values and/or comma-separated strings.
///
/// Duplicates are dropped keeping first occurrence; no actions means all of them.
pub fn parse_actions<S: AsRef<str>>(values: &[S]) -> Result<Vec<Action>, String> {
    let mut actions = Vec::new();
    for part in values.iter().flat_map(|v| v.as_ref().split(',')) {
        if part.trim().is_empty() {
            continue;
        }
        let action: Action = part.parse()?;
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
    if actions.is_empty() {
        actions.extend(Action::ALL);
    }
    Ok(actions)
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub actions: Vec<Action>,
    pub detector_backend: DetectorBackend,
    pub enforce_detection: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            actions: Action::ALL.to_vec(),
            detector_backend: DetectorBackend::default(),
            enforce_detection: true,
        }
    }
}

/// Attributes predicted for one face. Score maps are percentages.
#[derive(Debug, Clone, Serialize)]
pub struct FaceAttributes {
    pub region: FacialArea,
    pub face_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<ClassScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<ClassScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_emotion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<ClassScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_race: Option<String>,
}

/// Faces to work on: detected ones, or the whole image when detection is
/// skipped or finds nothing and is not enforced.
fn extract_faces<B: FaceBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
    label: &'static str,
    detector_backend: DetectorBackend,
    enforce_detection: bool,
) -> Result<Vec<BoundingBox>, AnalysisError> {
    let whole = || vec![BoundingBox::whole_image(image.width(), image.height())];

    if detector_backend == DetectorBackend::Skip {
        return Ok(whole());
    }

    let faces = backend.detect(image)?;
    if !faces.is_empty() {
        return Ok(faces);
    }
    if enforce_detection {
        return Err(AnalysisError::NoFace(label));
    }
    tracing::debug!(image = label, "no face detected; using whole image");
    Ok(whole())
}

fn represent_all<B: FaceBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
    faces: Vec<BoundingBox>,
) -> Result<Vec<(BoundingBox, Embedding)>, AnalysisError> {
    faces
        .into_iter()
        .map(|face| {
            let embedding = backend.represent(image, &face)?;
            Ok((face, embedding))
        })
        .collect()
}

/// Decide whether two images show the same person.
///
/// Every face pair across the two images is compared; the closest pair decides.
pub fn verify<B: FaceBackend + ?Sized>(
    backend: &mut B,
    img1: &RgbImage,
    img2: &RgbImage,
    options: &MatchOptions,
) -> Result<VerifyResult, AnalysisError> {
    let start = Instant::now();
    let metric = options.distance_metric;
    let threshold = options.effective_threshold();

    let faces1 = extract_faces(backend, img1, "img1", options.detector_backend, options.enforce_detection)?;
    let faces2 = extract_faces(backend, img2, "img2", options.detector_backend, options.enforce_detection)?;
    let reps1 = represent_all(backend, img1, faces1)?;
    let reps2 = represent_all(backend, img2, faces2)?;

    let mut best: Option<(f32, &BoundingBox, &BoundingBox)> = None;
    for (face1, emb1) in &reps1 {
        for (face2, emb2) in &reps2 {
            let distance = emb1.distance(emb2, metric);
            if best.map_or(true, |(d, _, _)| distance < d) {
                best = Some((distance, face1, face2));
            }
        }
    }

    // Both lists are non-empty: extract_faces never returns an empty list.
    let (distance, face1, face2) = best.ok_or(AnalysisError::NoFace("img1"))?;
    let verified = distance <= threshold;

    tracing::info!(verified, distance, threshold, metric = %metric, "verify complete");

    Ok(VerifyResult {
        verified,
        distance,
        threshold,
        model: RECOGNITION_MODEL_NAME,
        detector_backend: options.detector_backend,
        similarity_metric: metric,
        facial_areas: FacialAreas {
            img1: face1.to_facial_area(img1.width(), img1.height()),
            img2: face2.to_facial_area(img2.width(), img2.height()),
        },
        time: start.elapsed().as_secs_f64(),
    })
}

/// Compare the query's first face with every reference face under `db_root`.
///
/// Returns all candidates, closest first, each carrying the effective
/// threshold. Reference images that cannot be read or contain no face are
/// skipped with a warning.
pub fn search<B: FaceBackend + ?Sized>(
    backend: &mut B,
    query: &RgbImage,
    db_root: &Path,
    options: &MatchOptions,
) -> Result<Vec<IdentityMatch>, AnalysisError> {
    let metric = options.distance_metric;
    let threshold = options.effective_threshold();

    let db = FaceDatabase::open(db_root)?;

    let query_faces = extract_faces(backend, query, "img", options.detector_backend, options.enforce_detection)?;
    let query_face = query_faces
        .into_iter()
        .next()
        .ok_or(AnalysisError::NoFace("img"))?;
    let query_embedding = backend.represent(query, &query_face)?;
    let source = query_face.to_facial_area(query.width(), query.height());

    let mut candidates = Vec::new();

    for reference in db.images() {
        let image = match image_io::load_image(&reference.path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %reference.path.display(), error = %e, "skipping unreadable reference image");
                continue;
            }
        };

        let faces = match extract_faces(backend, &image, "reference", options.detector_backend, options.enforce_detection) {
            Ok(faces) => faces,
            Err(AnalysisError::NoFace(_)) => {
                tracing::warn!(path = %reference.path.display(), "skipping reference image without a detectable face");
                continue;
            }
            Err(e) => return Err(e),
        };

        for face in faces {
            let embedding = backend.represent(&image, &face)?;
            let target = face.to_facial_area(image.width(), image.height());
            candidates.push(IdentityMatch {
                identity: reference.path.display().to_string(),
                person: reference.person.clone(),
                distance: query_embedding.distance(&embedding, metric),
                threshold,
                target_x: target.x,
                target_y: target.y,
                target_w: target.w,
                target_h: target.h,
                source_x: source.x,
                source_y: source.y,
                source_w: source.w,
                source_h: source.h,
            });
        }
    }

    if candidates.is_empty() {
        return Err(AnalysisError::NoReferenceFaces(db.root().display().to_string()));
    }

    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.identity.cmp(&b.identity)));

    tracing::debug!(
        references = db.images().len(),
        people = db.people().len(),
        faces = candidates.len(),
        "reference search complete"
    );

    Ok(candidates)
}

/// Reference faces within the threshold of the query's first face, closest first.
pub fn find<B: FaceBackend + ?Sized>(
    backend: &mut B,
    query: &RgbImage,
    db_root: &Path,
    options: &MatchOptions,
) -> Result<Vec<IdentityMatch>, AnalysisError> {
    let mut matches = search(backend, query, db_root, options)?;
    matches.retain(|m| m.distance <= m.threshold);

    tracing::info!(
        matches = matches.len(),
        best = matches.first().map(|m| m.person.as_str()),
        "find complete"
    );

    Ok(matches)
}

/// Predict the requested attributes for every face in the image.
pub fn analyze<B: FaceBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
    options: &AnalyzeOptions,
) -> Result<Vec<FaceAttributes>, AnalysisError> {
    let faces = extract_faces(backend, image, "img", options.detector_backend, options.enforce_detection)?;
    let wants = |action: Action| options.actions.contains(&action);

    let mut results = Vec::with_capacity(faces.len());
    for face in &faces {
        let mut attrs = FaceAttributes {
            region: face.to_facial_area(image.width(), image.height()),
            face_confidence: face.confidence,
            age: None,
            gender: None,
            dominant_gender: None,
            emotion: None,
            dominant_emotion: None,
            race: None,
            dominant_race: None,
        };

        if wants(Action::Age) || wants(Action::Gender) {
            let prediction = backend.gender_age(image, face)?;
            if wants(Action::Age) {
                attrs.age = Some(prediction.age);
            }
            if wants(Action::Gender) {
                attrs.dominant_gender = prediction.gender.dominant().map(str::to_string);
                attrs.gender = Some(prediction.gender);
            }
        }
        if wants(Action::Emotion) {
            let scores = backend.emotion(image, face)?;
            attrs.dominant_emotion = scores.dominant().map(str::to_string);
            attrs.emotion = Some(scores);
        }
        if wants(Action::Race) {
            let scores = backend.race(image, face)?;
            attrs.dominant_race = scores.dominant().map(str::to_string);
            attrs.race = Some(scores);
        }

        results.push(attrs);
    }

    tracing::info!(faces = results.len(), actions = ?options.actions, "analyze complete");

    Ok(results)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::attributes::{GenderAge, EMOTION_LABELS, GENDER_LABELS, RACE_LABELS};
    use crate::backend::ModelStatus;
    use image::{ImageFormat, Rgb};

    /// Faces are detected on any image that is not pure black; embeddings are
    /// the mean colour inside the face box, so same-colour regions match.
    pub(crate) struct StubBackend {
        pub(crate) detect_calls: usize,
        pub(crate) race_loaded: bool,
        /// Boxes reported for every non-black image; empty means one box
        /// inset by a pixel from the image border.
        pub(crate) faces: Vec<BoundingBox>,
    }

    impl StubBackend {
        pub(crate) fn new() -> Self {
            Self { detect_calls: 0, race_loaded: true, faces: Vec::new() }
        }

        pub(crate) fn with_faces(faces: Vec<BoundingBox>) -> Self {
            Self { faces, ..Self::new() }
        }
    }

    impl FaceBackend for StubBackend {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError> {
            self.detect_calls += 1;
            if image.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(Vec::new());
            }
            if !self.faces.is_empty() {
                return Ok(self.faces.clone());
            }
            Ok(vec![BoundingBox {
                x: 1.0,
                y: 1.0,
                width: image.width() as f32 - 2.0,
                height: image.height() as f32 - 2.0,
                confidence: 0.99,
                landmarks: None,
            }])
        }

        fn represent(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, BackendError> {
            let x0 = face.x.max(0.0) as u32;
            let y0 = face.y.max(0.0) as u32;
            let x1 = ((face.x + face.width).max(0.0) as u32).min(image.width());
            let y1 = ((face.y + face.height).max(0.0) as u32).min(image.height());

            let mut sums = [0.0f32; 3];
            let mut n = 0.0f32;
            for (_, _, p) in image.enumerate_pixels().filter(|(x, y, _)| (x0..x1).contains(x) && (y0..y1).contains(y)) {
                for (c, sum) in sums.iter_mut().enumerate() {
                    *sum += p[c] as f32;
                }
                n += 1.0;
            }
            // Offset keeps black regions away from the zero vector.
            Ok(Embedding { values: sums.iter().map(|s| s / n.max(1.0) + 1.0).collect() })
        }

        fn gender_age(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<GenderAge, BackendError> {
            Ok(GenderAge { age: 31, gender: ClassScores::from_probabilities(&GENDER_LABELS, &[0.1, 0.9]) })
        }

        fn emotion(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<ClassScores, BackendError> {
            Ok(ClassScores::from_logits(&EMOTION_LABELS, &[0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]))
        }

        fn race(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<ClassScores, BackendError> {
            if !self.race_loaded {
                return Err(BackendError::ModelUnavailable("race", "race.onnx"));
            }
            Ok(ClassScores::from_probabilities(&RACE_LABELS, &[0.0, 0.0, 0.0, 0.9, 0.1, 0.0]))
        }

        fn status(&self) -> ModelStatus {
            ModelStatus { detector: true, recognizer: true, gender_age: true, emotion: true, race: self.race_loaded }
        }
    }

    /// Two side-by-side faces in a 32x32 image: left scored higher.
    pub(crate) fn left_and_right() -> Vec<BoundingBox> {
        let half = |x: f32, confidence: f32| BoundingBox { x, y: 0.0, width: 16.0, height: 32.0, confidence, landmarks: None };
        vec![half(0.0, 0.99), half(16.0, 0.8)]
    }

    /// Left half `left`, right half `right`.
    pub(crate) fn split(left: [u8; 3], right: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(32, 32, |x, _| Rgb(if x < 16 { left } else { right }))
    }

    pub(crate) fn solid(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(32, 32, Rgb(rgb))
    }

    fn cosine() -> MatchOptions {
        MatchOptions { enforce_detection: true, ..MatchOptions::default() }
    }

    pub(crate) fn write_png(path: &Path, rgb: [u8; 3]) {
        save_png(path, &solid(rgb));
    }

    pub(crate) fn save_png(path: &Path, image: &RgbImage) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        image.save_with_format(path, ImageFormat::Png).expect("save png");
    }

    #[test]
    fn test_verify_identical_images() {
        let mut backend = StubBackend::new();
        let img = solid([200, 40, 40]);
        let result = verify(&mut backend, &img, &img, &cosine()).expect("verify");
        assert!(result.verified);
        assert!(result.distance.abs() < 1e-5);
        assert_eq!(result.model, "ArcFace");
        assert_eq!(result.threshold, 0.68);
        assert_eq!(result.facial_areas.img1.w, 30);
    }

    #[test]
    fn test_verify_different_images() {
        let mut backend = StubBackend::new();
        let options = MatchOptions { threshold: Some(0.05), ..cosine() };
        let result = verify(&mut backend, &solid([250, 1, 1]), &solid([1, 1, 250]), &options).expect("verify");
        assert!(!result.verified);
        assert!(result.distance > 0.05);
        assert_eq!(result.threshold, 0.05);
    }

    #[test]
    fn test_verify_no_face_enforced() {
        let mut backend = StubBackend::new();
        let err = verify(&mut backend, &solid([9, 9, 9]), &solid([0, 0, 0]), &cosine()).unwrap_err();
        assert!(matches!(err, AnalysisError::NoFace("img2")));
    }

    #[test]
    fn test_verify_no_face_relaxed_uses_whole_image() {
        let mut backend = StubBackend::new();
        let options = MatchOptions { enforce_detection: false, ..cosine() };
        let black = solid([0, 0, 0]);
        let result = verify(&mut backend, &black, &black, &options).expect("verify");
        assert!(result.verified);
        assert_eq!(result.facial_areas.img2.w, 32);
    }

    #[test]
    fn test_skip_backend_never_detects() {
        let mut backend = StubBackend::new();
        let options = MatchOptions { detector_backend: DetectorBackend::Skip, ..cosine() };
        let img = solid([5, 5, 5]);
        verify(&mut backend, &img, &img, &options).expect("verify");
        assert_eq!(backend.detect_calls, 0);
    }

    #[test]
    fn test_find_orders_and_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write_png(&root.join("red/a.png"), [220, 10, 10]);
        write_png(&root.join("reddish/b.png"), [200, 60, 40]);
        write_png(&root.join("blue/c.png"), [10, 10, 220]);
        write_png(&root.join("ghost/d.png"), [0, 0, 0]);
        std::fs::create_dir_all(root.join("broken")).expect("mkdir");
        std::fs::write(root.join("broken/e.jpg"), b"nope").expect("write");

        let mut backend = StubBackend::new();
        let options = MatchOptions { threshold: Some(0.1), ..cosine() };
        let matches = find(&mut backend, &solid([220, 10, 10]), root, &options).expect("find");

        let people: Vec<&str> = matches.iter().map(|m| m.person.as_str()).collect();
        assert_eq!(people, vec!["red", "reddish"]);
        assert!(matches[0].distance <= matches[1].distance);
        assert!(matches[0].distance < 1e-5);
        assert!(matches.iter().all(|m| m.threshold == 0.1));
        assert_eq!(matches[0].source_w, 30);
    }

    #[test]
    fn test_find_empty_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut backend = StubBackend::new();
        let err = find(&mut backend, &solid([1, 2, 3]), dir.path(), &cosine()).unwrap_err();
        assert!(matches!(err, AnalysisError::Database(DatabaseError::Empty(_))));
    }

    #[test]
    fn test_find_only_faceless_references() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(&dir.path().join("ghost/a.png"), [0, 0, 0]);
        let mut backend = StubBackend::new();
        let err = find(&mut backend, &solid([1, 2, 3]), dir.path(), &cosine()).unwrap_err();
        assert!(matches!(err, AnalysisError::NoReferenceFaces(_)));
    }

    #[test]
    fn test_analyze_all_actions() {
        let mut backend = StubBackend::new();
        let results = analyze(&mut backend, &solid([100, 100, 100]), &AnalyzeOptions::default()).expect("analyze");
        assert_eq!(results.len(), 1);
        let face = &results[0];
        assert_eq!(face.age, Some(31));
        assert_eq!(face.dominant_gender.as_deref(), Some("Man"));
        assert_eq!(face.dominant_emotion.as_deref(), Some("happy"));
        assert_eq!(face.dominant_race.as_deref(), Some("white"));
    }

    #[test]
    fn test_analyze_subset_skips_missing_model() {
        let mut backend = StubBackend { race_loaded: false, ..StubBackend::new() };
        let options = AnalyzeOptions { actions: vec![Action::Emotion], ..AnalyzeOptions::default() };
        let results = analyze(&mut backend, &solid([100, 100, 100]), &options).expect("analyze");
        let json = serde_json::to_value(&results[0]).expect("serialize");
        assert!(json.get("emotion").is_some());
        assert!(json.get("age").is_none());
        assert!(json.get("race").is_none());
    }

    #[test]
    fn test_analyze_missing_model_fails() {
        let mut backend = StubBackend { race_loaded: false, ..StubBackend::new() };
        let err = analyze(&mut backend, &solid([100, 100, 100]), &AnalyzeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("race.onnx"));
    }

    #[test]
    fn test_verify_picks_closest_face_pair() {
        let mut backend = StubBackend::with_faces(left_and_right());
        let group = split([230, 20, 20], [20, 20, 230]);
        let result = verify(&mut backend, &group, &solid([20, 20, 230]), &cosine()).expect("verify");
        assert!(result.verified);
        assert!(result.distance < 1e-5);
        assert_eq!(result.facial_areas.img1.x, 16);
    }

    #[test]
    fn test_find_searches_only_the_first_query_face() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(&dir.path().join("red/a.png"), [230, 20, 20]);
        write_png(&dir.path().join("blue/b.png"), [20, 20, 230]);

        let mut backend = StubBackend::with_faces(left_and_right());
        let options = MatchOptions { threshold: Some(0.1), ..cosine() };
        let matches = find(&mut backend, &split([230, 20, 20], [20, 20, 230]), dir.path(), &options).expect("find");

        assert!(!matches.is_empty());
        assert!(matches.iter().all(|m| m.person == "red"));
        assert!(matches.iter().all(|m| m.source_x == 0 && m.source_w == 16));
    }

    #[test]
    fn test_find_compares_every_reference_face() {
        let dir = tempfile::tempdir().expect("tempdir");
        save_png(&dir.path().join("class/photo.png"), &split([230, 20, 20], [20, 20, 230]));

        let mut backend = StubBackend::with_faces(left_and_right());
        let options = MatchOptions { threshold: Some(0.1), ..cosine() };

        let candidates = search(&mut backend, &solid([20, 20, 230]), dir.path(), &options).expect("search");
        assert_eq!(candidates.len(), 2);

        let matches = find(&mut backend, &solid([20, 20, 230]), dir.path(), &options).expect("find");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].person, "class");
        assert_eq!(matches[0].target_x, 16);
        assert!(matches[0].distance < 1e-5);
    }

    #[test]
    fn test_analyze_reports_every_face() {
        let mut backend = StubBackend::with_faces(left_and_right());
        let results = analyze(&mut backend, &split([90, 90, 90], [60, 60, 60]), &AnalyzeOptions::default())
            .expect("analyze");
        assert_eq!(results.len(), 2);
        assert_eq!((results[0].region.x, results[1].region.x), (0, 16));
        assert_eq!(results[0].face_confidence, 0.99);
        assert_eq!(results[1].face_confidence, 0.8);
        assert!(results.iter().all(|r| r.dominant_emotion.as_deref() == Some("happy")));
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(parse_actions::<&str>(&[]), Ok(Action::ALL.to_vec()));
        assert_eq!(parse_actions(&["emotion, age", "age"]), Ok(vec![Action::Emotion, Action::Age]));
        assert!(parse_actions(&["height"]).is_err());
    }
}
