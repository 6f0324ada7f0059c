//! Wire messages exchanged between agents and the control plane
//!
//! All messages are JSON. Client ids are the string form of the host's
//! `ProvisionedHostId`.

use crate::task::TaskState;
use chrono::{DateTime, Utc};
use plangraph::{TaskCommand, TaskId};
use serde::{Deserialize, Serialize};

/// Periodic liveness report with host facts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub client_id: String,
    pub hostname: String,
    /// Seconds since boot
    pub uptime: u64,
    /// Unix time of the last boot
    pub boot_time: u64,
    pub proc_count: u64,
    pub os: String,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_used: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub available_tasks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub client_id: String,
}

/// Work handed to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub command: TaskCommand,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Reply to a task pull; `task` is null when nothing is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReply {
    pub task: Option<TaskAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub status: TaskState,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub output: String,
}

impl TaskStatusUpdate {
    /// The claim an agent sends before running a task
    pub fn claim(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskState::InProgress,
            error_message: String::new(),
            output: String::new(),
        }
    }

    pub fn complete(task_id: TaskId, output: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskState::Complete,
            error_message: String::new(),
            output: output.into(),
        }
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskState::Failed,
            error_message: error.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAck {
    pub ok: bool,
}

/// Error body returned by the HTTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_task_reply_is_null() {
        let json = serde_json::to_string(&TaskReply { task: None }).unwrap();
        assert_eq!(json, r#"{"task":null}"#);
    }

    #[test]
    fn test_status_update_defaults() {
        let id = TaskId::new();
        let json = format!(r#"{{"task_id":"{id}","status":"COMPLETE"}}"#);
        let update: TaskStatusUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(update, TaskStatusUpdate::complete(id, ""));
    }
}
