//! Error types for SFTP sessions
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Implementation: Every failure inside a request maps to exactly one SFTP
//! status code; only transport-level failures end a session.

use crate::protocol::StatusCode;
use thiserror::Error;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// SFTP error types
///
/// Handler implementations return these to signal typed failures; the session
/// maps each variant to a status code with [`Error::to_status_code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O error raised by a handler
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error on the session's own input or output stream
    #[error("Transport error: {0}")]
    Transport(std::io::Error),

    /// The input stream ended in the middle of a frame
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The session's cancellation token fired
    #[error("Session cancelled")]
    Cancelled,

    /// A frame declared a length above the configured maximum
    #[error("Frame of {len} bytes exceeds maximum message size of {max} bytes")]
    FrameTooLarge {
        /// Declared frame length
        len: u32,
        /// Configured maximum
        max: usize,
    },

    /// Malformed request payload
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// File or directory does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Handle was never issued or has been closed
    #[error("Handle not found: {0}")]
    HandleNotFound(String),

    /// Handle exists but refers to the wrong kind of object
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Permission denied
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid path
    ///
    /// NIST 800-53: SI-10 (Input Validation)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Operation or flag combination not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Read at or past the end of a file
    #[error("End of file")]
    EndOfFile,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error ends the session's read loop
    ///
    /// Everything else is reported to the client as a status and the session
    /// keeps going.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionClosed(_)
                | Error::Cancelled
                | Error::FrameTooLarge { .. }
        )
    }

    /// Check if error is due to client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::InvalidPath(_)
                | Error::FileNotFound(_)
                | Error::HandleNotFound(_)
                | Error::InvalidHandle(_)
                | Error::NotSupported(_)
        )
    }

    /// Check if error has security implications and should be logged as such
    pub fn is_security_event(&self) -> bool {
        matches!(self, Error::PermissionDenied(_) | Error::InvalidPath(_))
    }

    /// Get the SFTP status code for this error
    ///
    /// # NIST 800-53: SI-11
    /// # Implementation: Total mapping, unclassified errors become `Failure`
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                std::io::ErrorKind::Unsupported => StatusCode::OpUnsupported,
                std::io::ErrorKind::UnexpectedEof => StatusCode::Eof,
                _ => StatusCode::Failure,
            },
            Error::FileNotFound(_) | Error::HandleNotFound(_) => StatusCode::NoSuchFile,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::NotSupported(_) => StatusCode::OpUnsupported,
            Error::EndOfFile => StatusCode::Eof,
            Error::Protocol(_) | Error::InvalidPath(_) => StatusCode::BadMessage,
            Error::Transport(_) | Error::ConnectionClosed(_) => StatusCode::ConnectionLost,
            _ => StatusCode::Failure,
        }
    }

    /// Get sanitized error message for logs that may leave the host
    ///
    /// # NIST 800-53: SI-11 (Error Handling)
    /// # Implementation: Removes paths from access-control failures
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::PermissionDenied(_) => "Permission denied".to_string(),
            Error::InvalidPath(_) => "Invalid path".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}

// Additional error constructors and helpers
impl Error {
    /// Create handle not found error
    pub fn handle_not_found(handle: impl Into<String>) -> Self {
        Error::HandleNotFound(handle.into())
    }

    /// Create invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    /// Create protocol error
    pub fn protocol(context: impl Into<String>) -> Self {
        Error::Protocol(context.into())
    }

    /// Create not supported error
    pub fn not_supported(context: impl Into<String>) -> Self {
        Error::NotSupported(context.into())
    }
}
