//! Error types for TableCopy
//!
//! This module defines all error types used throughout the library. Errors
//! carry enough context (path, range, chunk sequence, attempt count) to
//! diagnose a failed transfer without re-running it.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Kind of transport-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not establish a connection
    Connect,
    /// Connection reset or closed mid-response
    Reset,
    /// Request attempt timed out
    Timeout,
    /// Failure while reading or writing a body
    Body,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Reset => "reset",
            Self::Timeout => "timeout",
            Self::Body => "body",
        };
        f.write_str(name)
    }
}

/// Main error type for TableCopy operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// Connection-level failure talking to the service
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Error reported by the storage service
    #[error("Service error {code}{}: {message}", .http_status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Service {
        code: i64,
        http_status: Option<u16>,
        message: String,
    },

    /// Retries exhausted for a retriable failure
    #[error("Transfer failed for {context} after {attempts} attempts: {source}")]
    TransferFailed {
        context: String,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    /// Malformed stream or unsupported resumption request
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Destination naming slot already taken
    #[error("Destination conflict at '{path}': {message}")]
    DestinationConflict { path: String, message: String },

    /// A parallel worker failed irrecoverably
    #[error("Worker for partition {partition} failed ({completed}/{total} partitions completed): {source}")]
    PartialWorkerFailure {
        partition: usize,
        completed: usize,
        total: usize,
        #[source]
        source: Box<TransferError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Transfer-level deadline exceeded
    #[error("Transfer deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// I/O error on a local file
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Create a service error
    pub fn service(code: i64, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            http_status,
            message: message.into(),
        }
    }

    /// Create a protocol violation
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a destination conflict
    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DestinationConflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error whose retries ran out
    pub fn exhausted(context: impl Into<String>, attempts: u32, source: TransferError) -> Self {
        Self::TransferFailed {
            context: context.into(),
            attempts,
            source: Box::new(source),
        }
    }
}

/// Result type alias for TableCopy operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::ProtocolViolation(format!("invalid JSON: {}", err))
    }
}
