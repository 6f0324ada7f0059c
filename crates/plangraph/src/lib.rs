//! # Plangraph
//!
//! Provisioning plans for range builds.
//!
//! A build is scoped as Build → Team → ProvisionedNetwork → ProvisionedHost →
//! ProvisioningStep. This crate turns that hierarchy into a dependency graph
//! of plan nodes and reconciles the graph toward the desired configuration
//! one commit at a time.
//!
//! ## Core Concepts
//!
//! - **PlanGraph**: DAG of plan nodes, each referencing exactly one entity
//!   and owning its own [`Status`]
//! - **BuildCommit**: One reconciliation pass (ROOT, REBUILD or DELETE) with
//!   a [`PlanDiff`] per affected node
//! - **Reconciler**: Walks diffs to a terminal state, launching ready nodes
//!   in parallel
//! - **BuildSnapshot**: Atomic on-disk persistence of all of the above
//!
//! ## Example
//!
//! ```ignore
//! use plangraph::{BuildCommit, BuildState, CommitPolicy, NoopBuilder, PlanBuilder, Reconciler};
//!
//! let mut state = BuildState::new("range", "spring-2026");
//! let team = state.add_team(1);
//! let net = state.add_network(team, "corp", "10.0.1.0/24")?;
//! let host = state.add_host(net, "web")?;
//! state.add_step(host, TaskCommand::Execute, vec!["install.sh".into()])?;
//!
//! let mut graph = PlanBuilder::from_state(&state)?;
//! let mut commit = BuildCommit::plan_root(&state, &graph);
//! commit.start(&CommitPolicy::default())?;
//!
//! let reconciler = Reconciler::new(&NoopBuilder, &dispatcher);
//! let report = reconciler.pass(&mut state, &mut graph, &mut commit)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`InfraBuilder`]: Deploys and tears down networks and hosts
//! - [`StepDispatcher`]: Turns provisioning steps into agent tasks

pub mod commit;
pub mod entities;
pub mod error;
pub mod graph;
pub mod ids;
pub mod reconcile;
pub mod status;
pub mod store;

pub use commit::{BuildCommit, CommitKind, CommitPolicy, CommitState, DiffState, PlanDiff};
pub use entities::{
    Build, BuildState, ConnectionInfo, ProvisionedHost, ProvisionedNetwork, ProvisioningStep,
    TaskCommand, Team, Transport,
};
pub use error::{CommitError, PlanError, Result};
pub use graph::{PlanBuilder, PlanGraph, PlanKind, PlanNode, PlanType};
pub use ids::{
    BuildId, CommitId, PlanId, ProvisionedHostId, ProvisionedNetworkId, ProvisioningStepId,
    TaskId, TeamId,
};
pub use reconcile::{InfraBuilder, NoopBuilder, PassReport, Reconciler, StepDispatcher, TaskResult};
pub use status::{Status, StatusState};
pub use store::BuildSnapshot;
