//! Reconciliation engine - applies a commit's diffs to the plan graph
//!
//! Each call to [`Reconciler::pass`] is one reconciliation pass:
//! 1. Read back terminal results of agent tasks launched earlier
//! 2. Launch every diff whose node is ready, in parallel
//! 3. Repeat step 2 until nothing new becomes ready
//! 4. Settle the commit (APPLIED, CANCELLED, or still INPROGRESS)
//!
//! Infrastructure nodes are handed to an [`InfraBuilder`]; ExecuteStep nodes
//! are handed to a [`StepDispatcher`], which turns them into agent tasks.

use crate::commit::{BuildCommit, CommitKind, CommitState, DiffState};
use crate::entities::{BuildState, ProvisionedHost, ProvisioningStep};
use crate::error::CommitError;
use crate::graph::{PlanGraph, PlanKind};
use crate::ids::{PlanId, TaskId};
use crate::status::StatusState;
use anyhow::Result;
use rayon::prelude::*;

/// Provisions and tears down infrastructure behind non-step plan nodes
///
/// Implementations call out to hypervisor, SDN, or cloud APIs.
pub trait InfraBuilder: Send + Sync {
    fn deploy(&self, state: &BuildState, kind: &PlanKind) -> Result<()>;

    fn teardown(&self, state: &BuildState, kind: &PlanKind) -> Result<()>;
}

/// Builder that succeeds immediately
pub struct NoopBuilder;

impl InfraBuilder for NoopBuilder {
    fn deploy(&self, _state: &BuildState, _kind: &PlanKind) -> Result<()> {
        Ok(())
    }

    fn teardown(&self, _state: &BuildState, _kind: &PlanKind) -> Result<()> {
        Ok(())
    }
}

/// Terminal outcome of a dispatched step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Complete,
    Failed { error: String },
}

/// Turns ExecuteStep nodes into agent work and reports back on it
pub trait StepDispatcher: Send + Sync {
    /// Queue the step for its host's agent
    fn dispatch(&self, host: &ProvisionedHost, step: &ProvisioningStep) -> Result<TaskId>;

    /// `None` while the task has not reached a terminal state
    fn poll(&self, task: TaskId) -> Result<Option<TaskResult>>;
}

/// What happened during one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Diffs still waiting on an unfinished or failed dependency
    pub blocked: usize,
    /// Diffs waiting on an agent or builder
    pub in_flight: usize,
    pub commit_state: CommitState,
}

impl PassReport {
    fn new() -> Self {
        Self {
            started: 0,
            completed: 0,
            failed: 0,
            deleted: 0,
            blocked: 0,
            in_flight: 0,
            commit_state: CommitState::InProgress,
        }
    }
}

enum Outcome {
    Done,
    Dispatched(TaskId),
    Failed(String),
}

pub struct Reconciler<'a> {
    builder: &'a dyn InfraBuilder,
    dispatcher: &'a dyn StepDispatcher,
}

impl<'a> Reconciler<'a> {
    pub fn new(builder: &'a dyn InfraBuilder, dispatcher: &'a dyn StepDispatcher) -> Self {
        Self {
            builder,
            dispatcher,
        }
    }

    /// Run one reconciliation pass over an INPROGRESS commit
    pub fn pass(
        &self,
        state: &mut BuildState,
        graph: &mut PlanGraph,
        commit: &mut BuildCommit,
    ) -> Result<PassReport, CommitError> {
        if commit.state != CommitState::InProgress {
            return Err(CommitError::NotStarted {
                commit: commit.id,
                state: commit.state,
            });
        }

        let mut report = PassReport::new();
        self.collect_results(graph, commit, &mut report)?;

        match commit.kind {
            CommitKind::Root | CommitKind::Rebuild => {
                prepare_rebuild(graph, commit)?;
                while self.launch_ready(state, graph, commit, &mut report)? > 0 {}
            }
            CommitKind::Delete => {
                while self.teardown_ready(state, graph, commit, &mut report)? > 0 {}
            }
        }

        settle(state, commit, &mut report)?;
        Ok(report)
    }

    fn collect_results(
        &self,
        graph: &mut PlanGraph,
        commit: &mut BuildCommit,
        report: &mut PassReport,
    ) -> Result<(), CommitError> {
        let pending: Vec<(PlanId, TaskId)> = commit
            .diffs
            .iter()
            .filter(|d| d.new_state == DiffState::InProgress)
            .filter_map(|d| d.task.map(|t| (d.plan, t)))
            .collect();

        for (plan, task) in pending {
            match self.dispatcher.poll(task) {
                Ok(Some(TaskResult::Complete)) => {
                    graph.complete(plan)?;
                    commit.set_diff_state(plan, DiffState::Complete)?;
                    report.completed += 1;
                }
                Ok(Some(TaskResult::Failed { error })) => {
                    log::warn!("Task {} for plan node {} failed: {}", task, plan, error);
                    graph.fail(plan, error.clone())?;
                    let diff = commit.diff_mut(plan)?;
                    diff.new_state = DiffState::Failed;
                    diff.error = Some(error);
                    report.failed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Could not poll task {}: {:#}", task, e);
                }
            }
        }
        Ok(())
    }

    fn launch_ready(
        &self,
        state: &BuildState,
        graph: &mut PlanGraph,
        commit: &mut BuildCommit,
        report: &mut PassReport,
    ) -> Result<usize, CommitError> {
        let candidates: Vec<PlanId> = commit
            .diffs
            .iter()
            .filter(|d| d.new_state == DiffState::Awaiting)
            .map(|d| d.plan)
            .collect();

        let mut launch: Vec<(PlanId, PlanKind)> = Vec::new();
        for plan in candidates {
            let node = graph.node(plan)?;
            let kind = node.kind;
            match node.status.state {
                // Already provisioned by an earlier commit
                StatusState::Complete => {
                    commit.set_diff_state(plan, DiffState::Complete)?;
                    continue;
                }
                StatusState::Awaiting => {}
                _ => continue,
            }
            if !graph.is_ready(plan)? {
                continue;
            }
            graph.start(plan)?;
            commit.set_diff_state(plan, DiffState::InProgress)?;
            launch.push((plan, kind));
        }

        if launch.is_empty() {
            return Ok(0);
        }
        report.started += launch.len();

        let outcomes: Vec<(PlanId, Outcome)> = launch
            .par_iter()
            .map(|(plan, kind)| (*plan, self.launch(state, kind)))
            .collect();

        for (plan, outcome) in outcomes {
            match outcome {
                Outcome::Done => {
                    graph.complete(plan)?;
                    commit.set_diff_state(plan, DiffState::Complete)?;
                    report.completed += 1;
                }
                Outcome::Dispatched(task) => {
                    log::debug!("Plan node {} dispatched as task {}", plan, task);
                    commit.diff_mut(plan)?.task = Some(task);
                }
                Outcome::Failed(error) => {
                    log::warn!("Plan node {} failed to launch: {}", plan, error);
                    graph.fail(plan, error.clone())?;
                    let diff = commit.diff_mut(plan)?;
                    diff.new_state = DiffState::Failed;
                    diff.error = Some(error);
                    report.failed += 1;
                }
            }
        }
        Ok(launch.len())
    }

    fn launch(&self, state: &BuildState, kind: &PlanKind) -> Outcome {
        match kind {
            PlanKind::ExecuteStep { step } => {
                let Some(step) = state.steps.get(step) else {
                    return Outcome::Failed(format!("unknown provisioning step {step}"));
                };
                let Some(host) = state.hosts.get(&step.host) else {
                    return Outcome::Failed(format!("unknown provisioned host {}", step.host));
                };
                match self.dispatcher.dispatch(host, step) {
                    Ok(task) => Outcome::Dispatched(task),
                    Err(e) => Outcome::Failed(format!("{e:#}")),
                }
            }
            other => match self.builder.deploy(state, other) {
                Ok(()) => Outcome::Done,
                Err(e) => Outcome::Failed(format!("{e:#}")),
            },
        }
    }

    /// Tear down nodes whose every next node is already gone
    fn teardown_ready(
        &self,
        state: &BuildState,
        graph: &mut PlanGraph,
        commit: &mut BuildCommit,
        report: &mut PassReport,
    ) -> Result<usize, CommitError> {
        let mut launch: Vec<(PlanId, PlanKind)> = Vec::new();
        for diff in commit.diffs.iter().filter(|d| d.new_state == DiffState::ToDelete) {
            let node = graph.node(diff.plan)?;
            if node.status.state == StatusState::InProgress {
                continue;
            }
            let children_gone = node
                .next
                .iter()
                .all(|next| commit.diff(*next).is_none_or(|d| d.new_state == DiffState::Deleted));
            if children_gone {
                launch.push((diff.plan, node.kind));
            }
        }

        if launch.is_empty() {
            return Ok(0);
        }
        for (plan, _) in &launch {
            commit.set_diff_state(*plan, DiffState::DeleteInProgress)?;
        }
        report.started += launch.len();

        let outcomes: Vec<(PlanId, Result<()>)> = launch
            .par_iter()
            .map(|(plan, kind)| {
                let result = match kind {
                    // Steps live on the host; removing the host removes them
                    PlanKind::ExecuteStep { .. } => Ok(()),
                    other => self.builder.teardown(state, other),
                };
                (*plan, result)
            })
            .collect();

        for (plan, result) in outcomes {
            match result {
                Ok(()) => {
                    graph.reset(plan)?;
                    commit.set_diff_state(plan, DiffState::Deleted)?;
                    report.deleted += 1;
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    log::warn!("Teardown of plan node {} failed: {}", plan, error);
                    graph.taint(plan, error.clone())?;
                    let diff = commit.diff_mut(plan)?;
                    diff.new_state = DiffState::Failed;
                    diff.error = Some(error);
                    report.failed += 1;
                }
            }
        }
        Ok(launch.len())
    }
}

/// Reset every TOREBUILD node so it runs again in this commit
fn prepare_rebuild(graph: &mut PlanGraph, commit: &mut BuildCommit) -> Result<(), CommitError> {
    let targets: Vec<PlanId> = commit
        .diffs
        .iter()
        .filter(|d| d.new_state == DiffState::ToRebuild)
        .map(|d| d.plan)
        .collect();
    for plan in targets {
        if graph.node(plan)?.status.state == StatusState::InProgress {
            continue;
        }
        graph.reset(plan)?;
        commit.set_diff_state(plan, DiffState::Awaiting)?;
    }
    Ok(())
}

fn settle(
    state: &mut BuildState,
    commit: &mut BuildCommit,
    report: &mut PassReport,
) -> Result<(), CommitError> {
    report.in_flight = commit
        .diffs
        .iter()
        .filter(|d| d.new_state.is_in_flight())
        .count();
    report.blocked = commit
        .diffs
        .iter()
        .filter(|d| {
            matches!(
                d.new_state,
                DiffState::Awaiting | DiffState::ToDelete | DiffState::ToRebuild
            )
        })
        .count();

    if commit.all_succeeded() {
        commit.mark_applied()?;
        state.build.revision = commit.revision;
        log::info!(
            "{} commit {} applied; build {} now at revision {}",
            commit.kind,
            commit.id,
            state.build.id,
            state.build.revision
        );
    } else if report.in_flight == 0 {
        // Nothing running and nothing launchable: a failure blocked the rest
        log::warn!(
            "{} commit {} cancelled with {} blocked diffs",
            commit.kind,
            commit.id,
            report.blocked
        );
        commit.cancel()?;
    }
    report.commit_state = commit.state;
    Ok(())
}
