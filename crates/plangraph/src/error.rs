//! Error types for plan graph and commit operations

use crate::commit::{CommitKind, CommitState};
use crate::ids::{CommitId, PlanId};
use crate::status::StatusState;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the plan graph and snapshot store
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("unknown plan node {0}")]
    UnknownNode(PlanId),

    /// Edges are frozen as soon as any node has left AWAITING
    #[error("plan graph is locked: edges cannot change once execution has begun")]
    GraphLocked,

    #[error("plan node {0} cannot depend on itself")]
    SelfLink(PlanId),

    #[error("linking {prev} -> {next} would create a cycle")]
    Cycle { prev: PlanId, next: PlanId },

    #[error("plan node {id} is not ready: prev node {blocking} is {state}")]
    NotReady {
        id: PlanId,
        blocking: PlanId,
        state: StatusState,
    },

    #[error("plan node {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: PlanId,
        from: StatusState,
        to: StatusState,
    },

    #[error("host {host} depends on unknown host {dependency}")]
    UnknownDependency { host: String, dependency: String },

    #[error("unknown {kind} {id}")]
    UnknownEntity { kind: &'static str, id: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid build snapshot {}: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while planning or applying a build commit
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("commit {commit} is {state} and can no longer change")]
    Closed { commit: CommitId, state: CommitState },

    #[error("{kind} commit {commit} needs approval before it can start")]
    NeedsApproval { commit: CommitId, kind: CommitKind },

    #[error("commit {commit} cannot move from {from} to {to}")]
    InvalidTransition {
        commit: CommitId,
        from: CommitState,
        to: CommitState,
    },

    #[error("commit {commit} is {state}; start it before reconciling")]
    NotStarted { commit: CommitId, state: CommitState },

    #[error("commit {open} is still open; finish or cancel it first")]
    AlreadyOpen { open: CommitId },

    #[error("unknown commit {0}")]
    UnknownCommit(CommitId),

    #[error("commit {commit} has no diff for plan node {plan}")]
    UnknownDiff { commit: CommitId, plan: PlanId },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Result alias for plan graph operations
pub type Result<T> = std::result::Result<T, PlanError>;
