use std::sync::Arc;

use thiserror::Error;

/// Which explicit deadline was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// ICE transport did not reach `connected` after the session answer
    IceConnect,
    /// No `track` event arrived for a pulled mid
    TrackResolution,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::IceConnect => write!(f, "ICE connection"),
            TimeoutKind::TrackResolution => write!(f, "track resolution"),
        }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Soft failure reported in a signaling response body
    #[error("Signaling error [{code}]: {description}")]
    Signaling { code: String, description: String },

    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No usable media device left")]
    DevicesExhausted,

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Shared failure of a bulk submission, delivered to every caller in the batch
    #[error(transparent)]
    Batch(Arc<AppError>),

    #[error("Client closed")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Build a signaling error from a response's error fields
    pub fn signaling(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Signaling {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Unwrap batch sharing down to the underlying error
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Batch(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), AppError::Timeout(_))
    }

    pub fn is_signaling(&self) -> bool {
        matches!(self.root(), AppError::Signaling { .. })
    }
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtcError(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Transport(e.to_string())
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
