//! Per-node progress tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress state of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusState {
    /// Not started yet
    Awaiting,
    /// Work has been launched and has not finished
    InProgress,
    /// Work finished with an error
    Failed,
    /// Work finished successfully
    Complete,
    /// Provisioned state can no longer be trusted
    Tainted,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awaiting => "AWAITING",
            Self::InProgress => "INPROGRESS",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
            Self::Tainted => "TAINTED",
        }
    }

    /// Whether this state ends a run of the node
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete | Self::Tainted)
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status owned by exactly one plan node (or agent task)
///
/// The owner holds it by value, so removing the owner removes the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: StatusState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl Status {
    /// A fresh status in the AWAITING state
    pub fn awaiting() -> Self {
        Self {
            state: StatusState::Awaiting,
            started_at: None,
            ended_at: None,
            failed: false,
            completed: false,
            error: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.state = StatusState::InProgress;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
    }

    pub fn mark_complete(&mut self) {
        self.state = StatusState::Complete;
        self.completed = true;
        self.failed = false;
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = StatusState::Failed;
        self.failed = true;
        self.completed = false;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_tainted(&mut self, reason: impl Into<String>) {
        self.state = StatusState::Tainted;
        self.error = Some(reason.into());
        self.ended_at = Some(Utc::now());
    }

    /// Return to AWAITING so the node can run again
    pub fn reset(&mut self) {
        *self = Self::awaiting();
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::awaiting()
    }
}
