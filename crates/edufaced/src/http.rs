//! HTTP routing: multipart endpoints in front of the engine thread.

use crate::attendance;
use crate::config::{parse_bool, Config};
use crate::engine::EngineHandle;
use crate::error::ApiError;
use crate::intake::{self, UploadForm};
use crate::store::Store;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use eduface_core::analysis::{self, FaceAttributes, IdentityMatch, VerifyResult};
use eduface_core::backend::{ModelStatus, RECOGNITION_MODEL_NAME};
use eduface_core::{AnalyzeOptions, DetectorBackend, DistanceMetric, MatchOptions};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub store: Store,
}

#[derive(Serialize)]
struct RecognizeResponse {
    matches: Vec<IdentityMatch>,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    results: Vec<FaceAttributes>,
}

#[derive(Serialize)]
struct StatusResponse {
    name: &'static str,
    version: &'static str,
    model: &'static str,
    detector_backend: DetectorBackend,
    distance_metric: DistanceMetric,
    db_path: String,
    models: ModelStatus,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/verify", post(verify))
        .route("/recognize", post(recognize))
        .route("/analyze", post(analyze))
        .merge(attendance::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn verify(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VerifyResult>, ApiError> {
    let form = read_form(multipart).await?;
    let img1 = form.image(&["image1", "img1"])?;
    let img2 = form.image(&["image2", "img2"])?;
    let options = match_options(&form, &state.config)?;

    let img1 = intake::decode(img1, "image1").await?;
    let img2 = intake::decode(img2, "image2").await?;

    Ok(Json(state.engine.verify(img1, img2, options).await?))
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let form = read_form(multipart).await?;
    let img = form.image(&["image", "img"])?;
    let options = match_options(&form, &state.config)?;

    let img = intake::decode(img, "image").await?;

    let matches = state.engine.recognize(img, options).await?;
    Ok(Json(RecognizeResponse { matches }))
}

async fn analyze(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let form = read_form(multipart).await?;
    let img = form.image(&["image", "img"])?;
    let options = AnalyzeOptions {
        actions: analysis::parse_actions(&form.texts("actions")?).map_err(ApiError::BadRequest)?,
        detector_backend: parsed(&form, "detector_backend")?.unwrap_or(state.config.detector_backend),
        enforce_detection: enforce_detection(&form)?.unwrap_or(state.config.enforce_detection),
    };

    let img = intake::decode(img, "image").await?;

    let results = state.engine.analyze(img, options).await?;
    Ok(Json(AnalyzeResponse { results }))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let models = state.engine.status().await?;
    Ok(Json(StatusResponse {
        name: "eduface",
        version: env!("CARGO_PKG_VERSION"),
        model: RECOGNITION_MODEL_NAME,
        detector_backend: state.config.detector_backend,
        distance_metric: state.config.distance_metric,
        db_path: state.config.db_path.display().to_string(),
        models,
    }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn read_form(multipart: Result<Multipart, MultipartRejection>) -> Result<UploadForm, ApiError> {
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    UploadForm::read(multipart).await
}

/// Matching parameters from the form, falling back to the daemon defaults.
pub(crate) fn match_options(form: &UploadForm, config: &Config) -> Result<MatchOptions, ApiError> {
    if let Some(model) = form.text("model_name")? {
        if !model.eq_ignore_ascii_case(RECOGNITION_MODEL_NAME) {
            return Err(ApiError::BadRequest(format!(
                "unsupported model_name '{model}' (expected {RECOGNITION_MODEL_NAME})"
            )));
        }
    }

    Ok(MatchOptions {
        detector_backend: parsed(form, "detector_backend")?.unwrap_or(config.detector_backend),
        distance_metric: parsed(form, "distance_metric")?.unwrap_or(config.distance_metric),
        threshold: non_negative(form, "threshold")?.or(config.max_distance),
        enforce_detection: enforce_detection(form)?.unwrap_or(config.enforce_detection),
    })
}

/// A finite, non-negative number field.
pub(crate) fn non_negative(form: &UploadForm, name: &str) -> Result<Option<f32>, ApiError> {
    match form.text(name)? {
        Some(v) => match v.parse::<f32>() {
            Ok(t) if t.is_finite() && t >= 0.0 => Ok(Some(t)),
            _ => Err(ApiError::BadRequest(format!(
                "invalid {name} '{v}' (expected a non-negative number)"
            ))),
        },
        None => Ok(None),
    }
}

fn parsed<T: FromStr<Err = String>>(form: &UploadForm, name: &str) -> Result<Option<T>, ApiError> {
    form.text(name)?
        .map(|v| v.parse().map_err(ApiError::BadRequest))
        .transpose()
}

pub(crate) fn enforce_detection(form: &UploadForm) -> Result<Option<bool>, ApiError> {
    form.text("enforce_detection")?
        .map(|v| {
            parse_bool(&v)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid enforce_detection '{v}' (expected true or false)")))
        })
        .transpose()
}
