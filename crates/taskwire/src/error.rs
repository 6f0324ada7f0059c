//! Error types for the task dispatch protocol.
//!
//! Errors are categorized so callers can tell a flaky link (log and try again
//! next tick) from a protocol violation (the request will never succeed).

use crate::task::TaskState;
use plangraph::TaskId;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Link or server trouble (transient, retryable).
    Transport,
    /// The peer sent something the protocol does not allow.
    Protocol,
    /// Unknown task or client.
    NotFound,
    /// Local file error.
    Io,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport)
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transport => "Control plane unreachable",
            Self::Protocol => "Protocol violation",
            Self::NotFound => "Unknown task or client",
            Self::Io => "Local I/O failure",
            Self::Other => "Unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors raised by the task board, client and server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("unknown client {0}")]
    UnknownClient(String),

    /// Task state changes must follow AWAITING → INPROGRESS → terminal.
    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("HTTP request failed: {message}")]
    Http {
        message: String,
        /// HTTP status code if available.
        status: Option<u16>,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an HTTP error.
    pub fn http(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Http {
            message: message.into(),
            status,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTask(_) | Self::UnknownClient(_) => ErrorCategory::NotFound,
            Self::InvalidTransition { .. } | Self::InvalidPayload(_) => ErrorCategory::Protocol,
            // 4xx means the server understood and refused
            Self::Http {
                status: Some(code), ..
            } if (400..500).contains(code) => ErrorCategory::Protocol,
            Self::Http { .. } => ErrorCategory::Transport,
            Self::Tls(_) => ErrorCategory::Other,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Http {
                message: format!("HTTP {code}"),
                status: Some(code),
            },
            other => Self::Http {
                message: other.to_string(),
                status: None,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
