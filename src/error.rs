//! Error types for volume data store operations

use thiserror::Error;

/// Vendor code used when an object or file does not exist.
pub const NOT_FOUND_CODE: i32 = 404;

/// Vendor code used when a backend returned fewer bytes than requested.
pub const SHORT_READ_CODE: i32 = 416;

/// Vendor code used for I/O failures that carry no code of their own.
pub const UNKNOWN_IO_CODE: i32 = -1;

/// Main error type for volume data store operations.
///
/// Errors are cheap to clone so a single failure can be recorded once (for a
/// cache key or a page) and handed to every caller that observes it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VdsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    /// I/O failure reported by a data provider or I/O manager. The code and
    /// message are the ones reported by the backend.
    #[error("IO error ({code}): {message}")]
    Io { code: i32, message: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("Request canceled: {0}")]
    Canceled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VdsError {
    /// Build an I/O error with a backend specific code.
    pub fn io(code: i32, message: impl Into<String>) -> Self {
        VdsError::Io {
            code,
            message: message.into(),
        }
    }

    /// Build the error reported for a missing object or file.
    pub fn not_found(name: &str) -> Self {
        VdsError::io(NOT_FOUND_CODE, format!("Object not found: {}", name))
    }

    /// Stable numeric code for this error.
    ///
    /// I/O errors return the backend's own code; every other category has a
    /// fixed code.
    pub fn code(&self) -> i32 {
        match self {
            VdsError::InvalidArgument(_) => 1,
            VdsError::IndexOutOfRange(_) => 2,
            VdsError::Io { code, .. } => *code,
            VdsError::Codec(_) => 4,
            VdsError::State(_) => 5,
            VdsError::ResourceLimit(_) => 6,
            VdsError::Canceled(_) => 7,
            VdsError::Configuration(_) => 8,
            VdsError::Serialization(_) => 9,
        }
    }

    /// True for errors produced by I/O or cancellation of an I/O request.
    pub fn is_io(&self) -> bool {
        matches!(self, VdsError::Io { .. } | VdsError::Canceled(_))
    }
}

/// Specialized Result type for volume data store operations
pub type Result<T> = std::result::Result<T, VdsError>;

impl From<std::io::Error> for VdsError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => NOT_FOUND_CODE,
            std::io::ErrorKind::UnexpectedEof => SHORT_READ_CODE,
            _ => err.raw_os_error().unwrap_or(UNKNOWN_IO_CODE),
        };
        VdsError::io(code, err.to_string())
    }
}

impl From<bincode::Error> for VdsError {
    fn from(err: bincode::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdsError {
    fn from(err: serde_json::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}
