use crate::engine::EngineError;
use crate::store::StoreError;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// Every variant renders as `{"detail": "<message>"}`.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request itself is unusable: missing field, bad image, bad parameter.
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Multipart(e) => e.status(),
            Self::Store(StoreError::DuplicateCode(_) | StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(EngineError::ChannelClosed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Engine(_) | Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), %detail, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), %detail, "request rejected");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eduface_core::AnalysisError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Engine(EngineError::Analysis(AnalysisError::NoFace("img1"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::Engine(EngineError::ChannelClosed).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::Store(StoreError::DuplicateCode("ana".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("student 7 not found".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Store(StoreError::Database(tokio_rusqlite::Error::ConnectionClosed)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_detail_body() {
        let response = ApiError::BadRequest("missing image field 'image1'".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["detail"], "missing image field 'image1'");
    }
}
