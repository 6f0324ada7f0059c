//! Agent tasks - concrete work items bound to one host

use chrono::{DateTime, Utc};
use plangraph::{ProvisionedHostId, ProvisioningStepId, TaskCommand, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Awaiting,
    InProgress,
    Failed,
    Complete,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete)
    }

    /// Legal moves: AWAITING → INPROGRESS → {COMPLETE | FAILED}
    ///
    /// Re-reporting the current state is accepted so a claim or terminal
    /// report retried after a lost reply stays harmless.
    pub fn can_move_to(&self, to: TaskState) -> bool {
        *self == to
            || matches!(
                (self, to),
                (Self::Awaiting, Self::InProgress)
                    | (Self::InProgress, Self::Complete | Self::Failed)
            )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Awaiting => "AWAITING",
            Self::InProgress => "INPROGRESS",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: TaskId,
    pub host: ProvisionedHostId,
    #[serde(default)]
    pub step: Option<ProvisioningStepId>,
    /// Per-host sequence number, strictly increasing
    pub number: u64,
    pub command: TaskCommand,
    #[serde(default)]
    pub args: Vec<String>,
    pub state: TaskState,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(
        host: ProvisionedHostId,
        step: Option<ProvisioningStepId>,
        number: u64,
        command: TaskCommand,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            host,
            step,
            number,
            command,
            args,
            state: TaskState::Awaiting,
            output: String::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(TaskState::Awaiting.can_move_to(TaskState::InProgress));
        assert!(TaskState::InProgress.can_move_to(TaskState::InProgress));
        assert!(TaskState::InProgress.can_move_to(TaskState::Complete));
        assert!(TaskState::InProgress.can_move_to(TaskState::Failed));
        assert!(!TaskState::Awaiting.can_move_to(TaskState::Complete));
        assert!(!TaskState::Complete.can_move_to(TaskState::InProgress));
        assert!(!TaskState::Failed.can_move_to(TaskState::Complete));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskState::InProgress).unwrap(),
            "\"INPROGRESS\""
        );
    }
}
