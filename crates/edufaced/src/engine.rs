use eduface_core::{analysis, identify};
use eduface_core::{
    AnalysisError, AnalyzeOptions, FaceAttributes, FaceBackend, IdentityMatch, Identification, MatchOptions,
    ModelStatus, VerifyResult,
};
use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests queued ahead of the engine thread.
const ENGINE_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("could not start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Verify {
        img1: RgbImage,
        img2: RgbImage,
        options: MatchOptions,
        reply: oneshot::Sender<Result<VerifyResult, AnalysisError>>,
    },
    Recognize {
        img: RgbImage,
        options: MatchOptions,
        reply: oneshot::Sender<Result<Vec<IdentityMatch>, AnalysisError>>,
    },
    Identify {
        img: RgbImage,
        options: MatchOptions,
        min_margin: f32,
        reply: oneshot::Sender<Result<Identification, AnalysisError>>,
    },
    Analyze {
        img: RgbImage,
        options: AnalyzeOptions,
        reply: oneshot::Sender<Result<Vec<FaceAttributes>, AnalysisError>>,
    },
    Status {
        reply: oneshot::Sender<ModelStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Compare the faces in two images.
    pub async fn verify(
        &self,
        img1: RgbImage,
        img2: RgbImage,
        options: MatchOptions,
    ) -> Result<VerifyResult, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Verify { img1, img2, options, reply })
            .await??)
    }

    /// Search the reference database for the face in `img`.
    pub async fn recognize(&self, img: RgbImage, options: MatchOptions) -> Result<Vec<IdentityMatch>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Recognize { img, options, reply })
            .await??)
    }

    /// Decide which single person in the reference database `img` shows.
    pub async fn identify(
        &self,
        img: RgbImage,
        options: MatchOptions,
        min_margin: f32,
    ) -> Result<Identification, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Identify { img, options, min_margin, reply })
            .await??)
    }

    /// Predict attributes for every face in `img`.
    pub async fn analyze(&self, img: RgbImage, options: AnalyzeOptions) -> Result<Vec<FaceAttributes>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Analyze { img, options, reply })
            .await??)
    }

    /// Which models the backend has loaded.
    pub async fn status(&self) -> Result<ModelStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The backend (already loaded by the caller, so startup fails fast on
/// missing models) moves onto the thread, which serves requests one at a
/// time until every handle is dropped.
pub fn spawn_engine(
    mut backend: Box<dyn FaceBackend + Send>,
    db_path: PathBuf,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("eduface-engine".into())
        .spawn(move || {
            tracing::info!(db = %db_path.display(), models = ?backend.status(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify { img1, img2, options, reply } => {
                        let result = analysis::verify(backend.as_mut(), &img1, &img2, &options);
                        log_failure("verify", &result);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { img, options, reply } => {
                        let result = analysis::find(backend.as_mut(), &img, &db_path, &options);
                        log_failure("recognize", &result);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Identify { img, options, min_margin, reply } => {
                        let result = identify::identify(backend.as_mut(), &img, &db_path, &options, min_margin);
                        log_failure("identify", &result);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Analyze { img, options, reply } => {
                        let result = analysis::analyze(backend.as_mut(), &img, &options);
                        log_failure("analyze", &result);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(backend.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn log_failure<T>(operation: &str, result: &Result<T, AnalysisError>) {
    if let Err(e) = result {
        tracing::warn!(operation, error = %e, "engine request failed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eduface_core::attributes::{ClassScores, GenderAge, EMOTION_LABELS, GENDER_LABELS};
    use eduface_core::{BackendError, BoundingBox, Embedding};

    /// Detects one face on any non-black image; embeds the mean colour.
    /// No race model is loaded.
    pub(crate) struct StubBackend;

    impl FaceBackend for StubBackend {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError> {
            if image.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox::whole_image(image.width(), image.height())])
        }

        fn represent(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, BackendError> {
            let n = (image.width() * image.height()).max(1) as f32;
            let mut sums = [0.0f32; 3];
            for p in image.pixels() {
                for (c, sum) in sums.iter_mut().enumerate() {
                    *sum += p[c] as f32;
                }
            }
            Ok(Embedding { values: sums.iter().map(|s| s / n + 1.0).collect() })
        }

        fn gender_age(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<GenderAge, BackendError> {
            Ok(GenderAge { age: 27, gender: ClassScores::from_probabilities(&GENDER_LABELS, &[0.8, 0.2]) })
        }

        fn emotion(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<ClassScores, BackendError> {
            Ok(ClassScores::from_logits(&EMOTION_LABELS, &[3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]))
        }

        fn race(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<ClassScores, BackendError> {
            Err(BackendError::ModelUnavailable("race", "race.onnx"))
        }

        fn status(&self) -> ModelStatus {
            ModelStatus { detector: true, recognizer: true, gender_age: true, emotion: true, race: false }
        }
    }

    fn solid(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(16, 16, image::Rgb(rgb))
    }

    #[tokio::test]
    async fn test_engine_round_trip() {
        let engine = spawn_engine(Box::new(StubBackend), PathBuf::from("/nonexistent")).expect("spawn");
        let options = MatchOptions { enforce_detection: true, ..MatchOptions::default() };

        let result = engine.verify(solid([10, 200, 10]), solid([10, 200, 10]), options).await.expect("verify");
        assert!(result.verified);

        let status = engine.status().await.expect("status");
        assert!(status.detector);
        assert!(!status.race);
    }

    #[tokio::test]
    async fn test_engine_surfaces_analysis_errors() {
        let engine = spawn_engine(Box::new(StubBackend), PathBuf::from("/nonexistent")).expect("spawn");
        let options = MatchOptions { enforce_detection: true, ..MatchOptions::default() };

        let err = engine.recognize(solid([1, 2, 3]), options).await.unwrap_err();
        assert!(matches!(err, EngineError::Analysis(AnalysisError::Database(_))));

        let err = engine.identify(solid([1, 2, 3]), options, 0.04).await.unwrap_err();
        assert!(matches!(err, EngineError::Analysis(AnalysisError::Database(_))));
    }
}
