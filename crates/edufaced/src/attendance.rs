//! Attendance marking by face and the student registry behind it.

use crate::error::ApiError;
use crate::http::{self, AppState};
use crate::intake;
use crate::store::{validate_code, Attendance, AttendanceEntry, NewStudent, Student, StudentFilter, StudentUpdate};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use eduface_core::backend::RECOGNITION_MODEL_NAME;
use eduface_core::{DetectorBackend, Identification, UnknownReason};
use serde::{Deserialize, Serialize};

const RECENT_LIMIT: (u32, u32) = (20, 200);
const HISTORY_LIMIT: (u32, u32) = (30, 500);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/attendance/mark", post(mark))
        .route("/attendance/today", get(today))
        .route("/attendance/recent", get(recent))
        .route("/students", get(list_students).post(create_student))
        .route("/students/{id}", get(get_student).put(update_student).delete(delete_student))
        .route("/students/{id}/attendance", get(student_history))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum MarkResponse {
    Marked {
        /// Student code, the reference folder name.
        student: String,
        name: String,
        attendance: Attendance,
        first_today: bool,
        distance: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        margin: Option<f32>,
        model: &'static str,
        detector: DetectorBackend,
    },
    Unknown {
        reason: UnknownReason,
        distance: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        margin: Option<f32>,
    },
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: bool,
    student: Student,
}

/// Recognise the face in `image` and record the student present today.
///
/// Detection is relaxed unless the form enforces it. `max_distance` overrides
/// `threshold`; `min_margin` overrides the configured margin.
async fn mark(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<MarkResponse>, ApiError> {
    let form = http::read_form(multipart).await?;
    let img = form.image(&["image", "img"])?;

    let mut options = http::match_options(&form, &state.config)?;
    if let Some(max_distance) = http::non_negative(&form, "max_distance")? {
        options.threshold = Some(max_distance);
    }
    options.enforce_detection = http::enforce_detection(&form)?.unwrap_or(false);
    let min_margin = http::non_negative(&form, "min_margin")?.unwrap_or(state.config.min_margin);

    let img = intake::decode(img, "image").await?;

    let response = match state.engine.identify(img, options, min_margin).await? {
        Identification::Unknown { reason, distance, margin } => MarkResponse::Unknown { reason, distance, margin },
        Identification::Identified { best, margin } => {
            let outcome = state
                .store
                .mark(best.person, Local::now().naive_local(), state.config.late_after)
                .await?;
            tracing::info!(
                code = %outcome.student.code,
                status = ?outcome.attendance.status,
                first_today = outcome.first_today,
                distance = best.distance,
                "attendance marked"
            );
            MarkResponse::Marked {
                student: outcome.student.code,
                name: outcome.student.name,
                attendance: outcome.attendance,
                first_today: outcome.first_today,
                distance: best.distance,
                margin,
                model: RECOGNITION_MODEL_NAME,
                detector: options.detector_backend,
            }
        }
    };

    Ok(Json(response))
}

async fn today(State(state): State<AppState>) -> Result<Json<Vec<AttendanceEntry>>, ApiError> {
    Ok(Json(state.store.attendance_on(Local::now().date_naive()).await?))
}

async fn recent(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<AttendanceEntry>>, ApiError> {
    let limit = limit(query, RECENT_LIMIT)?;
    Ok(Json(state.store.recent_attendance(limit).await?))
}

async fn list_students(
    State(state): State<AppState>,
    query: Result<Query<StudentFilter>, QueryRejection>,
) -> Result<Json<Vec<Student>>, ApiError> {
    let Query(filter) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let filter = StudentFilter { grade: present(filter.grade), section: present(filter.section), q: present(filter.q) };
    Ok(Json(state.store.students(filter).await?))
}

async fn create_student(
    State(state): State<AppState>,
    payload: Result<Json<NewStudent>, JsonRejection>,
) -> Result<Json<Student>, ApiError> {
    let Json(new) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let student = state.store.create_student(new).await?;
    tracing::info!(id = student.id, code = %student.code, "student created");
    Ok(Json(student))
}

async fn get_student(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Student>, ApiError> {
    let id = student_id(id)?;
    state.store.student(id).await?.map(Json).ok_or_else(|| not_found(id))
}

async fn update_student(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<StudentUpdate>, JsonRejection>,
) -> Result<Json<Student>, ApiError> {
    let id = student_id(id)?;
    let Json(update) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.store.update_student(id, update).await?.map(Json).ok_or_else(|| not_found(id))
}

/// Remove a student, their attendance and their reference folder.
async fn delete_student(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Deleted>, ApiError> {
    let id = student_id(id)?;
    let student = state.store.delete_student(id).await?.ok_or_else(|| not_found(id))?;

    if validate_code(&student.code).is_ok() {
        let folder = state.config.db_path.join(&student.code);
        match tokio::fs::remove_dir_all(&folder).await {
            Ok(()) => tracing::info!(path = %folder.display(), "removed reference images"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %folder.display(), error = %e, "could not remove reference images"),
        }
    }

    tracing::info!(id, code = %student.code, "student deleted");
    Ok(Json(Deleted { deleted: true, student }))
}

async fn student_history(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<Attendance>>, ApiError> {
    let id = student_id(id)?;
    let limit = limit(query, HISTORY_LIMIT)?;
    if state.store.student(id).await?.is_none() {
        return Err(not_found(id));
    }
    Ok(Json(state.store.student_attendance(id, limit).await?))
}

fn student_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, ApiError> {
    let Path(id) = path.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if id < 1 {
        return Err(ApiError::BadRequest(format!("invalid student id {id}")));
    }
    Ok(id)
}

fn limit(query: Result<Query<LimitQuery>, QueryRejection>, (default, max): (u32, u32)) -> Result<u32, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    match query.limit.unwrap_or(default) {
        limit if (1..=max).contains(&limit) => Ok(limit),
        other => Err(ApiError::BadRequest(format!("limit {other} out of range 1..={max}"))),
    }
}

fn not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("student {id} not found"))
}
