//! Error types for the command spanner.

use std::io;
use std::path::PathBuf;

/// Result type alias for spanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while binding workers to teams.
///
/// Failures of the spanned command itself are not errors; they are reported
/// per team in [`crate::SpanResult`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("team count must be at least 1")]
    NoTeams,

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read build state for team {team}: {source}")]
    Snapshot {
        team: u32,
        #[source]
        source: plangraph::PlanError,
    },

    #[error("team {team} is not part of the build in {}", .path.display())]
    UnknownTeam { team: u32, path: PathBuf },

    #[error("team {team} has no host named {hostname}")]
    UnknownHost { team: u32, hostname: String },

    /// The host exists but cannot be reached right now.
    #[error("host {hostname} of team {team} is not active: {reason}")]
    HostNotActive {
        team: u32,
        hostname: String,
        reason: String,
    },

    #[error("failed to start worker pool: {0}")]
    Pool(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
