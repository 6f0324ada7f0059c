//! Build commits and plan diffs
//!
//! A [`BuildCommit`] is one reconciliation pass over a build's plan graph.
//! Planning it computes one [`PlanDiff`] per affected node; applying it
//! (see [`crate::reconcile`]) walks those diffs to a terminal state.

use crate::entities::BuildState;
use crate::error::CommitError;
use crate::graph::{PlanGraph, PlanKind};
use crate::ids::{BuildId, CommitId, PlanId, TaskId};
use crate::status::StatusState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitKind {
    /// First apply of a build, diffed against an empty graph
    Root,
    /// Re-apply the subtree affected by a configuration change
    Rebuild,
    /// Tear the whole build down
    Delete,
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Root => "ROOT",
            Self::Rebuild => "REBUILD",
            Self::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitState {
    Planning,
    InProgress,
    Applied,
    Cancelled,
    Approved,
}

impl CommitState {
    /// APPLIED and CANCELLED commits are immutable
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Applied | Self::Cancelled)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Planning => "PLANNING",
            Self::InProgress => "INPROGRESS",
            Self::Applied => "APPLIED",
            Self::Cancelled => "CANCELLED",
            Self::Approved => "APPROVED",
        })
    }
}

/// Target state of one plan node within a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffState {
    Planning,
    Awaiting,
    InProgress,
    Failed,
    Complete,
    Tainted,
    ToDelete,
    DeleteInProgress,
    Deleted,
    ToRebuild,
}

impl DiffState {
    /// Finished successfully for this commit
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete | Self::Deleted)
    }

    /// Finished with a problem; dependents stay blocked for this pass
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Tainted)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InProgress | Self::DeleteInProgress)
    }
}

impl fmt::Display for DiffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Planning => "PLANNING",
            Self::Awaiting => "AWAITING",
            Self::InProgress => "INPROGRESS",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
            Self::Tainted => "TAINTED",
            Self::ToDelete => "TODELETE",
            Self::DeleteInProgress => "DELETEINPROGRESS",
            Self::Deleted => "DELETED",
            Self::ToRebuild => "TOREBUILD",
        })
    }
}

/// Computed transition for one plan node within one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub revision: u64,
    pub plan: PlanId,
    pub commit: CommitId,
    pub new_state: DiffState,
    /// Agent task launched for an ExecuteStep node
    #[serde(default)]
    pub task: Option<TaskId>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Which commit kinds need an explicit approval before they start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPolicy {
    pub require_approval: Vec<CommitKind>,
}

impl CommitPolicy {
    pub fn requires_approval(&self, kind: CommitKind) -> bool {
        self.require_approval.contains(&kind)
    }
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            require_approval: vec![CommitKind::Delete],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommit {
    pub id: CommitId,
    pub build: BuildId,
    pub kind: CommitKind,
    pub revision: u64,
    pub state: CommitState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub diffs: Vec<PlanDiff>,
}

impl BuildCommit {
    fn planning(state: &BuildState, kind: CommitKind) -> Self {
        Self {
            id: CommitId::new(),
            build: state.build.id,
            kind,
            revision: state.build.revision + 1,
            state: CommitState::Planning,
            created_at: Utc::now(),
            diffs: Vec::new(),
        }
    }

    fn push_diff(&mut self, plan: PlanId, new_state: DiffState) {
        self.diffs.push(PlanDiff {
            revision: self.revision,
            plan,
            commit: self.id,
            new_state,
            task: None,
            error: None,
        });
    }

    /// Plan a first apply: every reachable node is expected to run
    ///
    /// Nodes left FAILED or TAINTED by an earlier cancelled commit are
    /// planned TOREBUILD so they are reset and attempted again.
    pub fn plan_root(state: &BuildState, graph: &PlanGraph) -> Self {
        let mut commit = Self::planning(state, CommitKind::Root);
        for id in graph.traverse() {
            let broken = graph.node(id).is_ok_and(|node| {
                matches!(node.status.state, StatusState::Failed | StatusState::Tainted)
            });
            let new_state = if broken {
                DiffState::ToRebuild
            } else {
                DiffState::Awaiting
            };
            commit.push_diff(id, new_state);
        }
        log::info!(
            "Planned ROOT commit r{} with {} diffs",
            commit.revision,
            commit.diffs.len()
        );
        commit
    }

    /// Plan a rebuild of the subtrees whose configuration changed
    ///
    /// A node is affected when its entity differs between `current` and
    /// `desired`, or when its last run FAILED or was TAINTED. Every node
    /// downstream of an affected node is affected too.
    pub fn plan_rebuild(current: &BuildState, desired: &BuildState, graph: &PlanGraph) -> Self {
        let mut commit = Self::planning(current, CommitKind::Rebuild);

        let mut affected = BTreeSet::new();
        for node in graph.iter() {
            let broken = matches!(
                node.status.state,
                StatusState::Failed | StatusState::Tainted
            );
            if broken || entity_changed(&node.kind, current, desired) {
                affected.extend(graph.descendants(node.id));
            }
        }

        for id in graph.traverse() {
            if affected.contains(&id) {
                commit.push_diff(id, DiffState::ToRebuild);
            }
        }
        log::info!(
            "Planned REBUILD commit r{}: {} of {} nodes affected",
            commit.revision,
            commit.diffs.len(),
            graph.len()
        );
        commit
    }

    /// Plan a teardown of the whole graph
    pub fn plan_delete(state: &BuildState, graph: &PlanGraph) -> Self {
        let mut commit = Self::planning(state, CommitKind::Delete);
        for id in graph.traverse() {
            commit.push_diff(id, DiffState::ToDelete);
        }
        log::info!(
            "Planned DELETE commit r{} with {} diffs",
            commit.revision,
            commit.diffs.len()
        );
        commit
    }

    fn ensure_open(&self) -> Result<(), CommitError> {
        if self.state.is_closed() {
            return Err(CommitError::Closed {
                commit: self.id,
                state: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, from: &[CommitState], to: CommitState) -> Result<(), CommitError> {
        self.ensure_open()?;
        if !from.contains(&self.state) {
            return Err(CommitError::InvalidTransition {
                commit: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn approve(&mut self) -> Result<(), CommitError> {
        self.transition(&[CommitState::Planning], CommitState::Approved)
    }

    /// Begin applying diffs
    pub fn start(&mut self, policy: &CommitPolicy) -> Result<(), CommitError> {
        if self.state == CommitState::Planning && policy.requires_approval(self.kind) {
            return Err(CommitError::NeedsApproval {
                commit: self.id,
                kind: self.kind,
            });
        }
        self.transition(
            &[CommitState::Planning, CommitState::Approved],
            CommitState::InProgress,
        )
    }

    pub fn cancel(&mut self) -> Result<(), CommitError> {
        self.transition(
            &[
                CommitState::Planning,
                CommitState::Approved,
                CommitState::InProgress,
            ],
            CommitState::Cancelled,
        )
    }

    pub(crate) fn mark_applied(&mut self) -> Result<(), CommitError> {
        self.transition(&[CommitState::InProgress], CommitState::Applied)
    }

    pub fn diff(&self, plan: PlanId) -> Option<&PlanDiff> {
        self.diffs.iter().find(|d| d.plan == plan)
    }

    /// Mutable access to a diff; fails once the commit is closed
    pub fn diff_mut(&mut self, plan: PlanId) -> Result<&mut PlanDiff, CommitError> {
        self.ensure_open()?;
        let commit = self.id;
        self.diffs
            .iter_mut()
            .find(|d| d.plan == plan)
            .ok_or(CommitError::UnknownDiff { commit, plan })
    }

    pub fn set_diff_state(&mut self, plan: PlanId, state: DiffState) -> Result<(), CommitError> {
        self.diff_mut(plan)?.new_state = state;
        Ok(())
    }

    /// Every diff finished successfully
    pub fn all_succeeded(&self) -> bool {
        self.diffs.iter().all(|d| d.new_state.is_success())
    }

    pub fn count(&self, state: DiffState) -> usize {
        self.diffs.iter().filter(|d| d.new_state == state).count()
    }
}

/// Whether the entity behind a plan node differs between two build states
fn entity_changed(kind: &PlanKind, current: &BuildState, desired: &BuildState) -> bool {
    match kind {
        PlanKind::StartBuild { .. } => {
            current.build.environment != desired.build.environment
                || current.build.competition != desired.build.competition
        }
        PlanKind::StartTeam { team } => {
            match (current.teams.get(team), desired.teams.get(team)) {
                (Some(a), Some(b)) => a.revision != b.revision,
                _ => false,
            }
        }
        PlanKind::ProvisionNetwork { network } => {
            match (current.networks.get(network), desired.networks.get(network)) {
                (Some(a), Some(b)) => {
                    a.revision != b.revision || a.cidr != b.cidr || a.name != b.name
                }
                _ => false,
            }
        }
        PlanKind::ProvisionHost { host } => {
            match (current.hosts.get(host), desired.hosts.get(host)) {
                (Some(a), Some(b)) => {
                    a.revision != b.revision
                        || a.hostname != b.hostname
                        || a.subnet_ip != b.subnet_ip
                        || a.depends_on != b.depends_on
                }
                _ => false,
            }
        }
        PlanKind::ExecuteStep { step } => {
            match (current.steps.get(step), desired.steps.get(step)) {
                (Some(a), Some(b)) => {
                    a.revision != b.revision || a.fingerprint() != b.fingerprint()
                }
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskCommand;
    use crate::graph::PlanBuilder;
    use crate::ids::ProvisioningStepId;

    fn fixture() -> (BuildState, PlanGraph, ProvisioningStepId) {
        let mut state = BuildState::new("env", "comp");
        let team = state.add_team(1);
        let net = state.add_network(team, "corp", "10.0.0.0/24").unwrap();
        let host = state.add_host(net, "web").unwrap();
        let first = state
            .add_step(host, TaskCommand::Execute, vec!["one".into()])
            .unwrap();
        state
            .add_step(host, TaskCommand::Execute, vec!["two".into()])
            .unwrap();
        let graph = PlanBuilder::from_state(&state).unwrap();
        (state, graph, first)
    }

    #[test]
    fn test_root_commit_covers_every_node() {
        let (state, graph, _) = fixture();
        let commit = BuildCommit::plan_root(&state, &graph);
        assert_eq!(commit.kind, CommitKind::Root);
        assert_eq!(commit.revision, 1);
        assert_eq!(commit.state, CommitState::Planning);
        assert_eq!(commit.diffs.len(), graph.len());
        assert!(commit.diffs.iter().all(|d| d.new_state == DiffState::Awaiting));
    }

    #[test]
    fn test_rebuild_touches_only_affected_subtree() {
        let (state, graph, first) = fixture();
        let mut desired = state.clone();
        desired.steps.get_mut(&first).unwrap().args = vec!["changed".into()];

        let commit = BuildCommit::plan_rebuild(&state, &desired, &graph);
        // the changed step and the step after it
        assert_eq!(commit.diffs.len(), 2);
        let first_node = graph.find(&PlanKind::ExecuteStep { step: first }).unwrap();
        assert_eq!(commit.diffs[0].plan, first_node);
        assert!(commit.diffs.iter().all(|d| d.new_state == DiffState::ToRebuild));
    }

    #[test]
    fn test_rebuild_without_changes_is_empty() {
        let (state, graph, _) = fixture();
        let commit = BuildCommit::plan_rebuild(&state, &state, &graph);
        assert!(commit.diffs.is_empty());
        assert!(commit.all_succeeded());
    }

    #[test]
    fn test_delete_needs_approval() {
        let (state, graph, _) = fixture();
        let policy = CommitPolicy::default();
        let mut commit = BuildCommit::plan_delete(&state, &graph);
        assert!(commit.diffs.iter().all(|d| d.new_state == DiffState::ToDelete));

        let err = commit.start(&policy).unwrap_err();
        assert!(matches!(err, CommitError::NeedsApproval { .. }));

        commit.approve().unwrap();
        assert_eq!(commit.state, CommitState::Approved);
        commit.start(&policy).unwrap();
        assert_eq!(commit.state, CommitState::InProgress);
    }

    #[test]
    fn test_closed_commit_is_immutable() {
        let (state, graph, _) = fixture();
        let mut commit = BuildCommit::plan_root(&state, &graph);
        let plan = commit.diffs[0].plan;
        commit.cancel().unwrap();

        let err = commit.set_diff_state(plan, DiffState::Complete).unwrap_err();
        assert!(matches!(err, CommitError::Closed { .. }));
        assert!(commit.start(&CommitPolicy::default()).is_err());
        assert!(commit.cancel().is_err());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&DiffState::DeleteInProgress).unwrap(),
            "\"DELETEINPROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&DiffState::ToRebuild).unwrap(),
            "\"TOREBUILD\""
        );
    }
}
