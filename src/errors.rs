//! FastDFS Error Definitions
//!
//! This module defines all error types and error handling utilities for the FastDFS client.
//! Errors are categorized into common errors, protocol errors, network errors, and server errors.

use thiserror::Error;

/// Result type alias for FastDFS operations
pub type Result<T> = std::result::Result<T, FastDFSError>;

/// Base error type for all FastDFS errors
#[derive(Error, Debug)]
pub enum FastDFSError {
    /// Client has been closed
    #[error("Client is closed")]
    ClientClosed,

    /// Requested file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// No storage server is available
    #[error("No storage server available")]
    NoStorageServer,

    /// Connection timeout
    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    /// Network I/O timeout
    #[error("Network timeout during {0}")]
    NetworkTimeout(String),

    /// File ID format is invalid
    #[error("Invalid file ID: {0}")]
    InvalidFileId(String),

    /// Server response is invalid
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    /// Invalid metadata format
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Invalid argument was provided locally; never reaches the wire.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Protocol-level error: a non-zero, non-"not found" status, or a
    /// response body shorter than the command's minimum layout requires.
    #[error("Protocol error (code {code}): {message}")]
    Protocol { code: u8, message: String },

    /// Network-related error
    #[error("Network error during {operation} to {addr}: {source}")]
    Network {
        operation: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 conversion error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl FastDFSError {
    /// Whether the dispatcher should retry the exchange that produced this error.
    ///
    /// Only failures that are plausibly transient (timed out or the connection
    /// died mid-exchange) are retryable. Validation failures, protocol-level
    /// rejections, and `ClientClosed` are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FastDFSError::Network { .. }
                | FastDFSError::ConnectionTimeout(_)
                | FastDFSError::NetworkTimeout(_)
        )
    }
}

/// Maps FastDFS protocol status codes to Rust errors
///
/// Status code 0 indicates success (no error). Status 2 is the one status
/// with a dedicated variant (`FileNotFound`); every other non-zero status
/// (file-exists, invalid-argument, insufficient-space, and anything else a
/// server might return) folds into `Protocol`, since `InvalidArgument` is
/// reserved for failures caught by local validation before any request is
/// sent on the wire.
pub fn map_status_to_error(status: u8) -> Option<FastDFSError> {
    match status {
        0 => None,
        2 => Some(FastDFSError::FileNotFound(String::new())),
        _ => Some(FastDFSError::Protocol {
            code: status,
            message: format!("server returned status {}", status),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_class_errors_are_retryable() {
        assert!(FastDFSError::ConnectionTimeout("x".into()).is_retryable());
        assert!(FastDFSError::NetworkTimeout("read".into()).is_retryable());
        assert!(FastDFSError::Network {
            operation: "read".into(),
            addr: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        }
        .is_retryable());
    }

    #[test]
    fn application_errors_are_not_retryable() {
        assert!(!FastDFSError::FileNotFound("x".into()).is_retryable());
        assert!(!FastDFSError::ClientClosed.is_retryable());
        assert!(!FastDFSError::InvalidArgument("x".into()).is_retryable());
        assert!(!FastDFSError::Protocol {
            code: 99,
            message: "x".into()
        }
        .is_retryable());
        assert!(!FastDFSError::NoStorageServer.is_retryable());
    }

    #[test]
    fn map_status_to_error_covers_known_codes() {
        assert!(map_status_to_error(0).is_none());
        assert!(matches!(
            map_status_to_error(2),
            Some(FastDFSError::FileNotFound(_))
        ));
        assert!(matches!(
            map_status_to_error(6),
            Some(FastDFSError::Protocol { code: 6, .. })
        ));
        assert!(matches!(
            map_status_to_error(123),
            Some(FastDFSError::Protocol { code: 123, .. })
        ));
    }
}
