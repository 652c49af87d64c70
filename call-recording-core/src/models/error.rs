use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy reported to operators through status and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingErrorCode {
    InitializationFailed,
    EncodingFailed,
    StorageFailed,
    InvalidFormat,
    InsufficientSpace,
    PermissionDenied,
    NetworkError,
    Timeout,
    ConfigurationError,
    Unknown,
}

impl RecordingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitializationFailed => "InitializationFailed",
            Self::EncodingFailed => "EncodingFailed",
            Self::StorageFailed => "StorageFailed",
            Self::InvalidFormat => "InvalidFormat",
            Self::InsufficientSpace => "InsufficientSpace",
            Self::PermissionDenied => "PermissionDenied",
            Self::NetworkError => "NetworkError",
            Self::Timeout => "Timeout",
            Self::ConfigurationError => "ConfigurationError",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for RecordingErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur anywhere in the recording pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0} has been shut down")]
    Disposed(&'static str),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl RecordingError {
    pub fn code(&self) -> RecordingErrorCode {
        match self {
            Self::Initialization(_) => RecordingErrorCode::InitializationFailed,
            Self::Encoding(_) => RecordingErrorCode::EncodingFailed,
            Self::Storage(_) => RecordingErrorCode::StorageFailed,
            Self::InvalidFormat(_) => RecordingErrorCode::InvalidFormat,
            Self::InsufficientSpace { .. } => RecordingErrorCode::InsufficientSpace,
            Self::PermissionDenied(_) => RecordingErrorCode::PermissionDenied,
            Self::Network(_) => RecordingErrorCode::NetworkError,
            Self::Timeout(_) => RecordingErrorCode::Timeout,
            Self::Configuration(_) => RecordingErrorCode::ConfigurationError,
            Self::Disposed(_) | Self::Unknown(_) => RecordingErrorCode::Unknown,
        }
    }

    /// Wraps an I/O failure with context, keeping the taxonomy of the kind.
    pub fn io(context: &str, err: io::Error) -> Self {
        let message = format!("{}: {}", context, err);
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            io::ErrorKind::StorageFull => Self::InsufficientSpace {
                available: 0,
                required: 0,
            },
            io::ErrorKind::TimedOut => Self::Timeout(message),
            _ => Self::Storage(message),
        }
    }
}

impl From<io::Error> for RecordingError {
    fn from(err: io::Error) -> Self {
        Self::io("i/o failure", err)
    }
}

pub type Result<T> = std::result::Result<T, RecordingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_a_code() {
        assert_eq!(
            RecordingError::Initialization("x".into()).code(),
            RecordingErrorCode::InitializationFailed
        );
        assert_eq!(
            RecordingError::InsufficientSpace { available: 1, required: 2 }.code(),
            RecordingErrorCode::InsufficientSpace
        );
        assert_eq!(RecordingError::Disposed("manager").code(), RecordingErrorCode::Unknown);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            RecordingError::io("open", denied).code(),
            RecordingErrorCode::PermissionDenied
        );

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = RecordingError::io("open", missing);
        assert_eq!(err.code(), RecordingErrorCode::StorageFailed);
        assert!(err.to_string().contains("open"));
    }
}
