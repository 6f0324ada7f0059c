//! Plan graph - the DAG of provisioning work for one build
//!
//! Nodes carry exactly one typed reference (enforced by [`PlanKind`]) and
//! their own [`Status`]. An edge `prev -> next` means `next` may only start
//! once `prev` is COMPLETE.

use crate::entities::BuildState;
use crate::error::{PlanError, Result};
use crate::ids::{
    BuildId, PlanId, ProvisionedHostId, ProvisionedNetworkId, ProvisioningStepId, TeamId,
};
use crate::status::{Status, StatusState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// What a plan node provisions, with the single entity it refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanKind {
    StartBuild { build: BuildId },
    StartTeam { team: TeamId },
    ProvisionNetwork { network: ProvisionedNetworkId },
    ProvisionHost { host: ProvisionedHostId },
    ExecuteStep { step: ProvisioningStepId },
}

/// Discriminant of [`PlanKind`] without the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanType {
    StartBuild,
    StartTeam,
    ProvisionNetwork,
    ProvisionHost,
    ExecuteStep,
}

impl PlanKind {
    pub fn plan_type(&self) -> PlanType {
        match self {
            Self::StartBuild { .. } => PlanType::StartBuild,
            Self::StartTeam { .. } => PlanType::StartTeam,
            Self::ProvisionNetwork { .. } => PlanType::ProvisionNetwork,
            Self::ProvisionHost { .. } => PlanType::ProvisionHost,
            Self::ExecuteStep { .. } => PlanType::ExecuteStep,
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartBuild => "StartBuild",
            Self::StartTeam => "StartTeam",
            Self::ProvisionNetwork => "ProvisionNetwork",
            Self::ProvisionHost => "ProvisionHost",
            Self::ExecuteStep => "ExecuteStep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: PlanId,
    /// Depth of the node in execution order (root is 0)
    pub step_number: u32,
    pub kind: PlanKind,
    #[serde(default)]
    pub prev: Vec<PlanId>,
    #[serde(default)]
    pub next: Vec<PlanId>,
    pub status: Status,
}

/// Directed acyclic graph of plan nodes rooted at a StartBuild node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanGraph {
    #[serde(default)]
    root: Option<PlanId>,
    #[serde(default)]
    nodes: BTreeMap<PlanId, PlanNode>,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<PlanId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values()
    }

    pub fn node(&self, id: PlanId) -> Result<&PlanNode> {
        self.nodes.get(&id).ok_or(PlanError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: PlanId) -> Result<&mut PlanNode> {
        self.nodes.get_mut(&id).ok_or(PlanError::UnknownNode(id))
    }

    /// Find the node that refers to the given entity
    pub fn find(&self, kind: &PlanKind) -> Option<PlanId> {
        self.nodes.values().find(|n| &n.kind == kind).map(|n| n.id)
    }

    /// Create a node in the AWAITING state
    ///
    /// The first StartBuild node added becomes the root.
    pub fn add_node(&mut self, kind: PlanKind) -> PlanId {
        let id = PlanId::new();
        if self.root.is_none() && matches!(kind, PlanKind::StartBuild { .. }) {
            self.root = Some(id);
        }
        self.nodes.insert(
            id,
            PlanNode {
                id,
                step_number: 0,
                kind,
                prev: Vec::new(),
                next: Vec::new(),
                status: Status::awaiting(),
            },
        );
        id
    }

    /// Whether execution has begun on any node
    pub fn is_locked(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.status.state != StatusState::Awaiting)
    }

    /// Add an ordering edge: `next` runs only after `prev` is COMPLETE
    pub fn link(&mut self, prev: PlanId, next: PlanId) -> Result<()> {
        self.node(prev)?;
        self.node(next)?;
        if prev == next {
            return Err(PlanError::SelfLink(prev));
        }
        if self.is_locked() {
            return Err(PlanError::GraphLocked);
        }
        if self.node(prev)?.next.contains(&next) {
            return Ok(());
        }
        if self.reaches(next, prev) {
            return Err(PlanError::Cycle { prev, next });
        }

        self.node_mut(prev)?.next.push(next);
        self.node_mut(next)?.prev.push(prev);
        Ok(())
    }

    /// Whether `to` is reachable from `from` along next edges
    fn reaches(&self, from: PlanId, to: PlanId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.next.iter().copied());
            }
        }
        false
    }

    /// Remove a node together with its status and every edge touching it
    pub fn remove(&mut self, id: PlanId) -> Result<PlanNode> {
        let node = self.nodes.remove(&id).ok_or(PlanError::UnknownNode(id))?;
        for other in self.nodes.values_mut() {
            other.prev.retain(|p| *p != id);
            other.next.retain(|n| *n != id);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Ok(node)
    }

    /// First prev node that is not COMPLETE, if any
    fn blocking_prev(&self, id: PlanId) -> Result<Option<(PlanId, StatusState)>> {
        let node = self.node(id)?;
        for prev in &node.prev {
            let state = self.node(*prev)?.status.state;
            if state != StatusState::Complete {
                return Ok(Some((*prev, state)));
            }
        }
        Ok(None)
    }

    /// A node is eligible to run when every prev node is COMPLETE
    pub fn is_ready(&self, id: PlanId) -> Result<bool> {
        Ok(self.blocking_prev(id)?.is_none())
    }

    /// AWAITING nodes whose prev nodes are all COMPLETE, in traversal order
    pub fn ready_nodes(&self) -> Vec<PlanId> {
        self.traverse()
            .into_iter()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .is_some_and(|n| n.status.state == StatusState::Awaiting)
                    && self.is_ready(*id).unwrap_or(false)
            })
            .collect()
    }

    /// Move a node to INPROGRESS
    pub fn start(&mut self, id: PlanId) -> Result<()> {
        let from = self.node(id)?.status.state;
        if from != StatusState::Awaiting {
            return Err(PlanError::InvalidTransition {
                id,
                from,
                to: StatusState::InProgress,
            });
        }
        if let Some((blocking, state)) = self.blocking_prev(id)? {
            return Err(PlanError::NotReady {
                id,
                blocking,
                state,
            });
        }
        self.node_mut(id)?.status.mark_started();
        Ok(())
    }

    pub fn complete(&mut self, id: PlanId) -> Result<()> {
        let status = &mut self.node_mut(id)?.status;
        if status.state != StatusState::InProgress {
            return Err(PlanError::InvalidTransition {
                id,
                from: status.state,
                to: StatusState::Complete,
            });
        }
        status.mark_complete();
        Ok(())
    }

    pub fn fail(&mut self, id: PlanId, error: impl Into<String>) -> Result<()> {
        let status = &mut self.node_mut(id)?.status;
        if status.state != StatusState::InProgress {
            return Err(PlanError::InvalidTransition {
                id,
                from: status.state,
                to: StatusState::Failed,
            });
        }
        status.mark_failed(error);
        Ok(())
    }

    pub fn taint(&mut self, id: PlanId, reason: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.status.mark_tainted(reason);
        Ok(())
    }

    /// Return a node to AWAITING so it can run again
    pub fn reset(&mut self, id: PlanId) -> Result<()> {
        let status = &mut self.node_mut(id)?.status;
        if status.state == StatusState::InProgress {
            return Err(PlanError::InvalidTransition {
                id,
                from: status.state,
                to: StatusState::Awaiting,
            });
        }
        status.reset();
        Ok(())
    }

    /// Walk from the root along next edges, visiting a node only after all
    /// of its prev nodes
    ///
    /// Nodes unreachable from the root are not visited.
    pub fn traverse(&self) -> Vec<PlanId> {
        let Some(root) = self.root else {
            return Vec::new();
        };

        let reachable = self.descendants(root);
        let mut pending: HashMap<PlanId, usize> = reachable
            .iter()
            .filter_map(|id| {
                let node = self.nodes.get(id)?;
                let count = node.prev.iter().filter(|p| reachable.contains(p)).count();
                Some((*id, count))
            })
            .collect();

        let mut order = Vec::with_capacity(reachable.len());
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for next in &node.next {
                if let Some(count) = pending.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }
        order
    }

    /// `id` and every node reachable from it along next edges
    pub fn descendants(&self, id: PlanId) -> BTreeSet<PlanId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.next.iter().copied());
            }
        }
        seen
    }

    /// Recompute `step_number` as the longest distance from the root
    fn number_steps(&mut self) {
        let order = self.traverse();
        let mut depth: HashMap<PlanId, u32> = HashMap::new();
        for id in &order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let d = node
                .prev
                .iter()
                .filter_map(|p| depth.get(p))
                .max()
                .map_or(0, |d| d + 1);
            depth.insert(*id, d);
        }
        for (id, d) in depth {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.step_number = d;
            }
        }
    }
}

/// Builds the canonical plan graph for a build
pub struct PlanBuilder;

impl PlanBuilder {
    /// StartBuild → StartTeam → ProvisionNetwork → ProvisionHost → ExecuteStep chain
    ///
    /// Hosts additionally wait for the hosts named in their `depends_on`.
    pub fn from_state(state: &BuildState) -> Result<PlanGraph> {
        let mut graph = PlanGraph::new();
        let root = graph.add_node(PlanKind::StartBuild {
            build: state.build.id,
        });

        for team in state.teams_ordered() {
            let team_node = graph.add_node(PlanKind::StartTeam { team: team.id });
            graph.link(root, team_node)?;

            let mut host_nodes: HashMap<ProvisionedHostId, PlanId> = HashMap::new();
            for network_id in &team.networks {
                let network = state.networks.get(network_id).ok_or_else(|| {
                    PlanError::UnknownEntity {
                        kind: "network",
                        id: network_id.to_string(),
                    }
                })?;
                let net_node = graph.add_node(PlanKind::ProvisionNetwork {
                    network: network.id,
                });
                graph.link(team_node, net_node)?;

                for host_id in &network.hosts {
                    let host_node = graph.add_node(PlanKind::ProvisionHost { host: *host_id });
                    graph.link(net_node, host_node)?;
                    host_nodes.insert(*host_id, host_node);

                    let mut prev = host_node;
                    for step in state.steps_for_host(*host_id) {
                        let step_node = graph.add_node(PlanKind::ExecuteStep { step: step.id });
                        graph.link(prev, step_node)?;
                        prev = step_node;
                    }
                }
            }

            for (host_id, host_node) in &host_nodes {
                let Some(host) = state.hosts.get(host_id) else {
                    continue;
                };
                for dependency in &host.depends_on {
                    let dep = state.host_in_team(team.id, dependency).ok_or_else(|| {
                        PlanError::UnknownDependency {
                            host: host.hostname.clone(),
                            dependency: dependency.clone(),
                        }
                    })?;
                    let dep_node = host_nodes.get(&dep.id).copied().ok_or_else(|| {
                        PlanError::UnknownDependency {
                            host: host.hostname.clone(),
                            dependency: dependency.clone(),
                        }
                    })?;
                    graph.link(dep_node, *host_node)?;
                }
            }
        }

        graph.number_steps();
        log::debug!(
            "Built plan graph with {} nodes for build {}",
            graph.len(),
            state.build.id
        );
        Ok(graph)
    }
}
