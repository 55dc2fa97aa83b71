//! Single-identity decision for attendance: the closest reference face must be
//! within the distance threshold and clearly closer than any other person.

use crate::analysis::{self, AnalysisError, IdentityMatch, MatchOptions};
use crate::backend::FaceBackend;
use image::RgbImage;
use serde::Serialize;
use std::path::Path;

/// Separation required between the best person and the runner-up when a
/// request does not give one.
pub const DEFAULT_MIN_MARGIN: f32 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    AboveThreshold,
    LowMargin,
}

#[derive(Debug, Clone)]
pub enum Identification {
    /// `margin` is `None` when no other person is in the database.
    Identified { best: IdentityMatch, margin: Option<f32> },
    Unknown { reason: UnknownReason, distance: f32, margin: Option<f32> },
}

/// Decide on candidates sorted closest first.
///
/// The margin is measured against the closest face of a *different* person,
/// so several photos of the same person never block each other.
pub fn decide(candidates: &[IdentityMatch], max_distance: f32, min_margin: f32) -> Option<Identification> {
    let best = candidates.first()?;
    let margin = candidates
        .iter()
        .find(|c| c.person != best.person)
        .map(|runner_up| runner_up.distance - best.distance);

    let decision = if best.distance > max_distance {
        Identification::Unknown { reason: UnknownReason::AboveThreshold, distance: best.distance, margin }
    } else if margin.is_some_and(|m| m < min_margin) {
        Identification::Unknown { reason: UnknownReason::LowMargin, distance: best.distance, margin }
    } else {
        Identification::Identified { best: best.clone(), margin }
    };
    Some(decision)
}

/// Search the reference database and decide who the query's first face is.
pub fn identify<B: FaceBackend + ?Sized>(
    backend: &mut B,
    query: &RgbImage,
    db_root: &Path,
    options: &MatchOptions,
    min_margin: f32,
) -> Result<Identification, AnalysisError> {
    let candidates = analysis::search(backend, query, db_root, options)?;
    let max_distance = options.effective_threshold();

    let decision = decide(&candidates, max_distance, min_margin)
        .ok_or_else(|| AnalysisError::NoReferenceFaces(db_root.display().to_string()))?;

    match &decision {
        Identification::Identified { best, margin } => {
            tracing::info!(person = %best.person, distance = best.distance, margin = ?margin, "identified");
        }
        Identification::Unknown { reason, distance, margin } => {
            tracing::info!(?reason, distance, margin = ?margin, max_distance, min_margin, "not identified");
        }
    }

    Ok(decision)
}
