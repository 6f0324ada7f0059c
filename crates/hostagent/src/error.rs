//! Error types for the host agent.

use std::io;
use std::path::PathBuf;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while running commands and persisting agent state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arguments for {command}: {message}")]
    InvalidArgs {
        command: &'static str,
        message: String,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{program} exited with {status}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error("download of {url} failed: {message}")]
    Download {
        url: String,
        message: String,
        /// HTTP status code if available.
        status: Option<u16>,
    },

    #[error("hash mismatch for {}: expected {expected}, got {actual}", .path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state file {}: {source}", .path.display())]
    StateFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("platform operation failed: {0}")]
    Platform(String),

    #[error("diagnostics server: {0}")]
    Diagnostics(String),

    #[error(transparent)]
    Transport(#[from] taskwire::Error),
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_args(command: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            command,
            message: message.into(),
        }
    }

    /// Output captured before the failure, if any
    pub fn output(&self) -> &str {
        match self {
            Self::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

impl taskwire::Retryable for Error {
    /// Network failures and 5xx responses are worth another attempt
    fn is_retryable(&self) -> bool {
        match self {
            Self::Download { status, .. } => status.is_none_or(|code| code >= 500),
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Why a `Load` request was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// A load request is already in flight.
    #[error("worker is busy with another load request")]
    WorkerBusy,

    #[error("revision {requested} is older than current revision {current}")]
    StaleRevision { current: u64, requested: u64 },

    #[error("revision {revision} is already loaded")]
    DuplicateRevision { revision: u64 },

    #[error("revision {requested} does not follow current revision {current}")]
    RevisionMismatch { current: u64, requested: u64 },

    #[error("worker did not answer the load request in time")]
    LoadTimedOut,

    #[error("state file rejected: {0}")]
    InvalidState(String),

    #[error("worker has stopped")]
    WorkerStopped,
}
