//! # Hostagent
//!
//! The per-host side of a range build.
//!
//! ## Pieces
//!
//! - [`Dispatcher`]: heartbeat and task-pull loops against a
//!   [`taskwire::ControlPlane`]; claims each task, runs it and reports the
//!   result, dropping back-to-back redeliveries
//! - [`Worker`]: runs the host's step sequence from a revisioned state file,
//!   one step at a time, surviving reboots
//! - [`CommandExecutor`]: what each task command does on this host
//! - [`DiagServer`]: local HTTP view of the worker
//!
//! ## Reboots
//!
//! A REBOOT task is reported COMPLETE before the reboot is issued. A step
//! that reboots records the current boot marker in the state file; the
//! sequence resumes once the marker changes.

pub mod commands;
pub mod diag;
pub mod dispatcher;
pub mod error;
pub mod facts;
pub mod platform;
pub mod recent;
pub mod shutdown;
pub mod statefile;
pub mod worker;

pub use commands::{
    CommandExecutor, CommandOutput, SerialRunner, StepRunner, extract, file_digest,
};
pub use diag::{DiagContext, DiagServer, RemoveAgentFiles, SelfDestruct};
pub use dispatcher::{AgentConfig, Dispatcher, PullOutcome};
pub use error::{Error, LoadError, Result};
pub use facts::HostFacts;
pub use platform::{Platform, SystemPlatform};
pub use recent::RecentTasks;
pub use shutdown::Shutdown;
pub use statefile::{BuildStatus, HostState, PendingReboot, StepRecord, StepStatus};
pub use worker::{
    LogStream, Next, RevisionPolicy, Worker, WorkerPhase, WorkerSnapshot, WorkerTimings,
    normalize, step_log_path,
};
