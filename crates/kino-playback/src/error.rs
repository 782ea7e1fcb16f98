//! Error types for Kino Playback

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for playback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a provider refused to start playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayRejection {
    /// The host blocked unmuted playback without a user gesture
    NotAllowed,
    /// The host blocked playback entirely, even muted
    Blocked,
    /// The element was reset or reassigned before playback began
    Aborted,
}

impl std::fmt::Display for PlayRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayRejection::NotAllowed => write!(f, "not allowed"),
            PlayRejection::Blocked => write!(f, "blocked"),
            PlayRejection::Aborted => write!(f, "aborted"),
        }
    }
}

/// Playback error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Setup errors
    #[error("No provider can play item: {item}")]
    NoProvider { item: String },

    #[error("Failed to load provider {name}: {reason}")]
    ProviderLoad { name: String, reason: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    // Play rejection errors
    #[error("Play attempt rejected: {0}")]
    PlayRejected(PlayRejection),

    // Provider runtime errors
    #[error("Provider error {code}: {message}")]
    Provider { code: u32, message: String },

    #[error("Media element unavailable")]
    ElementUnavailable,

    // Controller errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid playlist index: {index} (playlist has {len} items)")]
    InvalidItemIndex { index: usize, len: usize },

    #[error("Playlist is empty")]
    EmptyPlaylist,

    #[error("Controller not ready")]
    NotReady,

    #[error("Instream session already active")]
    InstreamActive,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl Error {
    /// Create a provider runtime error
    pub fn provider(code: u32, message: impl Into<String>) -> Self {
        Error::Provider {
            code,
            message: message.into(),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PlayRejected(_) | Error::Cancelled | Error::ElementUnavailable
        )
    }

    /// Returns true if this error happened while setting an item up
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::NoProvider { .. } | Error::ProviderLoad { .. } | Error::UnknownProvider(_)
        )
    }

    /// Returns the error code for event payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NoProvider { .. } => "NO_PROVIDER",
            Error::ProviderLoad { .. } => "PROVIDER_LOAD",
            Error::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            Error::PlayRejected(_) => "PLAY_REJECTED",
            Error::Provider { .. } => "PROVIDER",
            Error::ElementUnavailable => "ELEMENT_UNAVAILABLE",
            Error::Cancelled => "CANCELLED",
            Error::InvalidItemIndex { .. } => "INVALID_INDEX",
            Error::EmptyPlaylist => "EMPTY_PLAYLIST",
            Error::NotReady => "NOT_READY",
            Error::InstreamActive => "INSTREAM_ACTIVE",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
        }
    }

    /// Stable numeric classification
    pub fn classification(&self) -> ErrorCode {
        match self {
            Error::NoProvider { .. } | Error::UnknownProvider(_) => ErrorCode::SETUP_NO_PROVIDER,
            Error::ProviderLoad { .. } => ErrorCode::SETUP_PROVIDER_LOAD,
            Error::PlayRejected(_) => ErrorCode::PLAY_REJECTED,
            Error::Provider { code, .. } => ErrorCode(ErrorCode::MEDIA_BASE + code % 1000),
            Error::ElementUnavailable => ErrorCode::MEDIA_ELEMENT,
            Error::InvalidItemIndex { .. } | Error::EmptyPlaylist => ErrorCode::PLAYLIST,
            _ => ErrorCode::INTERNAL,
        }
    }

    /// Turn this error into a payload that can cross the event boundary
    pub fn to_payload(&self, fatal: bool) -> ErrorPayload {
        ErrorPayload {
            code: self.classification().0,
            key: self.error_code().to_string(),
            message: self.to_string(),
            fatal,
        }
    }
}

/// Numeric error classification delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SETUP_NO_PROVIDER: ErrorCode = ErrorCode(102_630);
    pub const SETUP_PROVIDER_LOAD: ErrorCode = ErrorCode(104_153);
    pub const PLAYLIST: ErrorCode = ErrorCode(102_700);
    pub const PLAY_REJECTED: ErrorCode = ErrorCode(303_200);
    pub const MEDIA_ELEMENT: ErrorCode = ErrorCode(221_000);
    pub const MEDIA_BASE: u32 = 224_000;
    pub const INTERNAL: ErrorCode = ErrorCode(100_000);

    /// True for codes produced while setting an item up
    pub fn is_setup(&self) -> bool {
        (100_000..200_000).contains(&self.0) && *self != ErrorCode::INTERNAL
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured error delivered through events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric classification
    pub code: u32,
    /// Symbolic key
    pub key: String,
    /// Human-readable message
    pub message: String,
    /// Whether playback of the item stopped
    pub fatal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_classified() {
        let err = Error::NoProvider {
            item: "a.xyz".into(),
        };
        assert!(err.is_setup_error());
        assert!(err.classification().is_setup());
        assert_eq!(err.error_code(), "NO_PROVIDER");
    }

    #[test]
    fn test_provider_code_is_stable() {
        let err = Error::provider(3, "decode failed");
        assert_eq!(err.classification(), ErrorCode(224_003));
        assert!(!err.classification().is_setup());

        let payload = err.to_payload(true);
        assert_eq!(payload.code, 224_003);
        assert_eq!(payload.key, "PROVIDER");
        assert!(payload.fatal);
    }

    #[test]
    fn test_rejections_are_recoverable() {
        assert!(Error::PlayRejected(PlayRejection::NotAllowed).is_recoverable());
        assert!(!Error::provider(1, "network").is_recoverable());
    }
}
