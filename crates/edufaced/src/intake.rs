//! Image intake: multipart form collection and image decoding.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::Multipart;
use image::RgbImage;
use std::collections::HashMap;

/// All parts of a multipart upload, keyed by field name.
///
/// Repeated fields keep every value in arrival order.
#[derive(Debug, Default)]
pub struct UploadForm {
    parts: HashMap<String, Vec<Bytes>>,
}

impl UploadForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let data = field.bytes().await?;
            form.parts.entry(name).or_default().push(data);
        }
        Ok(form)
    }

    /// Bytes of the first non-empty part under any of `names`.
    ///
    /// `names[0]` is the canonical name reported when the image is missing.
    pub fn image(&self, names: &[&str]) -> Result<Bytes, ApiError> {
        names
            .iter()
            .filter_map(|n| self.parts.get(*n))
            .flatten()
            .find(|b| !b.is_empty())
            .cloned()
            .ok_or_else(|| ApiError::BadRequest(format!("missing image field '{}'", names[0])))
    }

    /// First value of a text field, trimmed; empty values count as absent.
    pub fn text(&self, name: &str) -> Result<Option<String>, ApiError> {
        match self.parts.get(name).and_then(|v| v.first()) {
            None => Ok(None),
            Some(bytes) => {
                let value = std::str::from_utf8(bytes)
                    .map_err(|_| ApiError::BadRequest(format!("field '{name}' is not valid UTF-8")))?
                    .trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
        }
    }

    /// Every value of a repeated text field.
    pub fn texts(&self, name: &str) -> Result<Vec<String>, ApiError> {
        self.parts
            .get(name)
            .into_iter()
            .flatten()
            .map(|bytes| {
                std::str::from_utf8(bytes)
                    .map(str::to_string)
                    .map_err(|_| ApiError::BadRequest(format!("field '{name}' is not valid UTF-8")))
            })
            .collect()
    }
}

/// Decode an uploaded image off the async runtime.
pub async fn decode(bytes: Bytes, field: &'static str) -> Result<RgbImage, ApiError> {
    tokio::task::spawn_blocking(move || eduface_core::decode_image(&bytes))
        .await
        .map_err(|e| ApiError::Internal(format!("image decode task failed: {e}")))?
        .map_err(|e| ApiError::BadRequest(format!("{field}: {e}")))
}
