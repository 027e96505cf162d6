//! Error types for compression operations.

use thiserror::Error;

/// Result type alias for compression operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Compression error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Input data is corrupted or invalid.
    #[error("corrupted data: {message}")]
    CorruptedData { message: String },

    /// Buffer too small for output.
    #[error("buffer too small: need {required} bytes, got {provided}")]
    BufferTooSmall { required: usize, provided: usize },

    /// Invalid compression level specified.
    #[error("invalid compression level {level}: must be in range [{min}, {max}]")]
    InvalidLevel { level: i32, min: i32, max: i32 },

    /// Unexpected end of input stream.
    #[error("unexpected EOF after {bytes_read} bytes")]
    UnexpectedEof { bytes_read: usize },

    /// I/O error from underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream state error.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Unsupported feature or format.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a corrupted data error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::CorruptedData {
            message: message.into(),
        }
    }

    /// Create a buffer too small error.
    pub fn buffer_too_small(required: usize, provided: usize) -> Self {
        Error::BufferTooSmall { required, provided }
    }

    /// Create an unexpected EOF error.
    pub fn unexpected_eof(bytes_read: usize) -> Self {
        Error::UnexpectedEof { bytes_read }
    }

    /// Create an I/O error with a custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io(std::io::Error::other(message.into()))
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::CorruptedData { .. } => "corrupted_data",
            Error::BufferTooSmall { .. } => "buffer_too_small",
            Error::InvalidLevel { .. } => "invalid_level",
            Error::UnexpectedEof { .. } => "unexpected_eof",
            Error::Io(_) => "io_error",
            Error::InvalidState { .. } => "invalid_state",
            Error::Unsupported(_) => "unsupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_message() {
        let err = Error::corrupted("EXUBERANT_NIBBLE");
        assert_eq!(err.to_string(), "corrupted data: EXUBERANT_NIBBLE");
        assert_eq!(err.category(), "corrupted_data");
    }

    #[test]
    fn test_buffer_too_small() {
        let err = Error::buffer_too_small(100, 10);
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("10"));
    }
}
