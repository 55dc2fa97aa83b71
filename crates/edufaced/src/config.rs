use chrono::NaiveTime;
use eduface_core::identify::DEFAULT_MIN_MARGIN;
use eduface_core::{DetectorBackend, DistanceMetric};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8000).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root of the reference database read by /recognize.
    pub db_path: PathBuf,
    /// Detector backend used when a request does not name one.
    pub detector_backend: DetectorBackend,
    /// Distance metric used when a request does not name one.
    pub distance_metric: DistanceMetric,
    /// Threshold override; `None` uses the metric's default.
    pub max_distance: Option<f32>,
    /// Whether a missing face is an error when the request does not say.
    pub enforce_detection: bool,
    /// Upper bound on a request body, in bytes.
    pub max_upload_bytes: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// SQLite file holding students and attendance.
    pub attendance_db: PathBuf,
    /// Required distance gap between the identified person and the runner-up.
    pub min_margin: f32,
    /// Marks after this local time are late.
    pub late_after: NaiveTime,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            model_dir: eduface_core::default_model_dir(),
            db_path: PathBuf::from("db"),
            detector_backend: DetectorBackend::Scrfd,
            distance_metric: DistanceMetric::Cosine,
            max_distance: None,
            enforce_detection: true,
            max_upload_bytes: 16 * 1024 * 1024,
            intra_threads: 2,
            attendance_db: PathBuf::from("attendance.sqlite3"),
            min_margin: DEFAULT_MIN_MARGIN,
            late_after: NaiveTime::from_hms_opt(7, 30, 0).unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load configuration from `EDUFACE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind = match get("EDUFACE_BIND") {
            Some(v) => v.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "EDUFACE_BIND",
                reason: e.to_string(),
            })?,
            None => defaults.bind,
        };

        let detector_backend = match get("EDUFACE_DETECTOR") {
            Some(v) => v
                .parse()
                .map_err(|reason| ConfigError::Invalid { key: "EDUFACE_DETECTOR", reason })?,
            None => defaults.detector_backend,
        };

        let distance_metric = match get("EDUFACE_DISTANCE_METRIC") {
            Some(v) => v
                .parse()
                .map_err(|reason| ConfigError::Invalid { key: "EDUFACE_DISTANCE_METRIC", reason })?,
            None => defaults.distance_metric,
        };

        let late_after = match get("EDUFACE_LATE_AFTER") {
            Some(v) => parse_time(&v).ok_or_else(|| ConfigError::Invalid {
                key: "EDUFACE_LATE_AFTER",
                reason: format!("'{v}' is not a HH:MM time"),
            })?,
            None => defaults.late_after,
        };

        Ok(Self {
            bind,
            model_dir: get("EDUFACE_MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir),
            db_path: get("EDUFACE_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            detector_backend,
            distance_metric,
            max_distance: get("EDUFACE_MAX_DISTANCE")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|d| d.is_finite() && *d >= 0.0),
            enforce_detection: get("EDUFACE_ENFORCE_DETECTION")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.enforce_detection),
            max_upload_bytes: parse_or(get("EDUFACE_MAX_UPLOAD_BYTES"), defaults.max_upload_bytes),
            intra_threads: parse_or(get("EDUFACE_INTRA_THREADS"), defaults.intra_threads).max(1),
            attendance_db: get("EDUFACE_ATTENDANCE_DB").map(PathBuf::from).unwrap_or(defaults.attendance_db),
            min_margin: get("EDUFACE_MIN_MARGIN")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|m| m.is_finite() && *m >= 0.0)
                .unwrap_or(defaults.min_margin),
            late_after,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

/// Lenient boolean used for env vars and form fields.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config.bind.port(), 8000);
        assert_eq!(config.db_path, PathBuf::from("db"));
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.detector_backend, DetectorBackend::Scrfd);
        assert!(config.enforce_detection);
        assert!(config.max_distance.is_none());
        assert_eq!(config.intra_threads, 2);
        assert_eq!(config.attendance_db, PathBuf::from("attendance.sqlite3"));
        assert_eq!(config.min_margin, 0.04);
        assert_eq!(config.late_after.to_string(), "07:30:00");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("EDUFACE_BIND", "127.0.0.1:9000"),
            ("EDUFACE_DB_PATH", "/srv/faces"),
            ("EDUFACE_DISTANCE_METRIC", "euclidean_l2"),
            ("EDUFACE_DETECTOR", "skip"),
            ("EDUFACE_MAX_DISTANCE", "1.2"),
            ("EDUFACE_ENFORCE_DETECTION", "no"),
            ("EDUFACE_INTRA_THREADS", "0"),
            ("EDUFACE_ATTENDANCE_DB", "/var/lib/eduface/attendance.db"),
            ("EDUFACE_MIN_MARGIN", "0.1"),
            ("EDUFACE_LATE_AFTER", "08:05"),
        ])
        .expect("config");
        assert_eq!(config.bind.to_string(), "127.0.0.1:9000");
        assert_eq!(config.db_path, PathBuf::from("/srv/faces"));
        assert_eq!(config.distance_metric, DistanceMetric::EuclideanL2);
        assert_eq!(config.detector_backend, DetectorBackend::Skip);
        assert_eq!(config.max_distance, Some(1.2));
        assert!(!config.enforce_detection);
        assert_eq!(config.intra_threads, 1);
        assert_eq!(config.attendance_db, PathBuf::from("/var/lib/eduface/attendance.db"));
        assert_eq!(config.min_margin, 0.1);
        assert_eq!(config.late_after.to_string(), "08:05:00");
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let config = load(&[
            ("EDUFACE_MAX_UPLOAD_BYTES", "lots"),
            ("EDUFACE_MAX_DISTANCE", "-3"),
        ])
        .expect("config");
        assert_eq!(config.max_upload_bytes, 16 * 1024 * 1024);
        assert!(config.max_distance.is_none());
    }

    #[test]
    fn test_invalid_enum_is_error() {
        let err = load(&[("EDUFACE_DISTANCE_METRIC", "manhattan")]).unwrap_err();
        assert!(err.to_string().contains("EDUFACE_DISTANCE_METRIC"));
        assert!(load(&[("EDUFACE_DETECTOR", "opencv")]).is_err());
        assert!(load(&[("EDUFACE_BIND", "not an addr")]).is_err());
        assert!(load(&[("EDUFACE_LATE_AFTER", "half past seven")]).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
