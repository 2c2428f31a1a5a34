use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use crate::core::retry::Retryable;

/// Centralized error types for the application
///
/// Every failure in the pipeline is converted to this enum. The variants follow
/// four families: validation (rejected before any network or subprocess work),
/// upstream (the media source misbehaved), subprocess (ffmpeg / yt-dlp / ffprobe)
/// and resource (size ceilings). `status()` maps each to the HTTP status used
/// when the error is reported before response headers are sent.
///
/// # Example
///
/// ```
/// use mediaforge::core::error::AppError;
///
/// let err = AppError::PayloadTooLarge("Video too large.".into());
/// assert_eq!(err.status().as_u16(), 413);
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed or non-http(s) URL
    #[error("Invalid URL.")]
    InvalidUrl,

    /// URL host is outside the configured allow-list
    #[error("Host not allowed.")]
    HostNotAllowed,

    /// A required query parameter is absent
    #[error("{0} required")]
    MissingParameter(&'static str),

    /// Unsupported container/codec combination or unknown codec name
    #[error("Unsupported combination: {0}")]
    Unsupported(String),

    /// Upstream content type does not match the requested media kind
    #[error("{0}")]
    NotMediaType(String),

    /// Media is larger than the configured ceiling
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Source unreachable: connection failure or non-2xx status
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Source exists but cannot be used (private, removed, blocked)
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// External downloader exited with a non-zero status
    #[error("Downloader failed (exit code {code:?}): {detail}")]
    Downloader { code: Option<i32>, detail: String },

    /// A subprocess could not be started (binary missing or not executable)
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// ffmpeg exited with a non-zero status
    #[error("Encoder failed (exit code {code:?}): {detail}")]
    EncoderFailed { code: Option<i32>, detail: String },

    /// Metadata probe failed for a reason other than source availability
    #[error("Probe failed: {0}")]
    Probe(String),

    /// A subprocess or pipeline exceeded its deadline
    #[error("{0} timed out after {1}s")]
    Timeout(String, u64),

    /// The download client went away while the pipeline was running
    #[error("Client disconnected")]
    ClientDisconnected,

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// HTTP status used when the error is reported before headers are sent.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidUrl | AppError::MissingParameter(_) | AppError::Unsupported(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::HostNotAllowed => StatusCode::FORBIDDEN,
            AppError::NotMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Upstream(_) | AppError::Downloader { .. } | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::SourceUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Spawn { .. }
            | AppError::EncoderFailed { .. }
            | AppError::Probe(_)
            | AppError::ClientDisconnected
            | AppError::Io(_)
            | AppError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and log correlation.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::InvalidUrl
            | AppError::HostNotAllowed
            | AppError::MissingParameter(_)
            | AppError::Unsupported(_)
            | AppError::NotMediaType(_) => "validation",
            AppError::PayloadTooLarge(_) => "resource",
            AppError::Upstream(_) | AppError::SourceUnavailable(_) | AppError::Http(_) => "upstream",
            AppError::Downloader { .. } => "downloader",
            AppError::Spawn { .. } => "spawn",
            AppError::EncoderFailed { .. } => "encoder",
            AppError::Probe(_) | AppError::Json(_) => "probe",
            AppError::Timeout(..) => "timeout",
            AppError::ClientDisconnected => "client_disconnected",
            AppError::Io(_) => "io",
        }
    }
}

impl Retryable for AppError {
    fn is_retryable(&self) -> bool {
        match self {
            AppError::Timeout(..) | AppError::Probe(_) | AppError::Upstream(_) | AppError::Json(_) => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect(),
            AppError::Io(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed ({}): {}", self.category(), self);
        } else {
            log::warn!("Request rejected ({}): {}", self.category(), self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_statuses() {
        assert_eq!(AppError::InvalidUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::HostNotAllowed.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Unsupported("mp4/vp9".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotMediaType("Not an image URL.".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn test_upstream_distinguishes_unreachable_from_invalid() {
        let unreachable = AppError::Upstream("Upstream returned 404".into());
        let invalid = AppError::SourceUnavailable("Private video".into());
        assert_ne!(unreachable.status(), invalid.status());
        assert_eq!(unreachable.category(), invalid.category());
    }

    #[test]
    fn test_subprocess_errors_are_server_errors() {
        let spawn = AppError::Spawn {
            program: "ffmpeg".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(spawn.status().is_server_error());
        assert!(spawn.to_string().contains("ffmpeg"));

        let encoder = AppError::EncoderFailed {
            code: Some(1),
            detail: "Invalid data found when processing input".into(),
        };
        assert_eq!(encoder.category(), "encoder");
        assert!(encoder.status().is_server_error());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Timeout("yt-dlp".into(), 60).is_retryable());
        assert!(AppError::Probe("empty output".into()).is_retryable());
        assert!(!AppError::SourceUnavailable("removed".into()).is_retryable());
        assert!(!AppError::InvalidUrl.is_retryable());
        assert!(!AppError::Spawn {
            program: "ffprobe".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        }
        .is_retryable());
    }
}
