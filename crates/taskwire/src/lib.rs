//! # Taskwire
//!
//! Pull-based task dispatch between the control plane and host agents.
//!
//! ## Protocol
//!
//! 1. The agent sends a [`Heartbeat`] on a fixed interval; the reply says
//!    whether tasks are queued for it.
//! 2. If so, the agent pulls one task ([`ControlPlane::get_task`]).
//! 3. It claims the task by reporting INPROGRESS, runs it, and reports
//!    COMPLETE or FAILED with output ([`ControlPlane::inform_task_status`]).
//!
//! Transport errors are categorized as retryable (see [`Error::is_retryable`]);
//! protocol violations are not.
//!
//! ## Components
//!
//! - [`TaskBoard`]: in-process task store, also the reconciler's
//!   [`plangraph::StepDispatcher`]
//! - [`HttpControlPlane`]: HTTPS client with certificate pinning
//! - [`ControlPlaneServer`]: HTTP(S) server exposing a board
//! - [`retry`]: swappable retry policies

pub mod board;
pub mod client;
pub mod error;
pub mod messages;
pub mod plane;
pub mod retry;
pub mod server;
pub mod task;

pub use board::{ClientRecord, TaskBoard};
pub use client::HttpControlPlane;
pub use error::{Error, ErrorCategory, Result};
pub use messages::{
    Heartbeat, HeartbeatReply, StatusAck, TaskAssignment, TaskReply, TaskRequest,
    TaskStatusUpdate,
};
pub use plane::ControlPlane;
pub use plangraph::{TaskCommand, TaskId};
pub use retry::{
    ExponentialBackoff, FixedInterval, LogCallback, RetryCallback, RetryPolicy, Retryable,
    with_retry,
};
pub use server::{ControlPlaneServer, TlsFiles};
pub use task::{AgentTask, TaskState};
