//! On-disk build snapshots
//!
//! A snapshot holds everything the control plane knows about one build: the
//! scoping entities, the plan graph with per-node status, and the commit log.
//! Saves go to a temp file next to the target and are renamed into place so a
//! crash never leaves a half-written snapshot behind.

use crate::commit::{BuildCommit, CommitState};
use crate::entities::BuildState;
use crate::error::{CommitError, PlanError, Result};
use crate::graph::PlanGraph;
use crate::ids::CommitId;
use crate::reconcile::{PassReport, Reconciler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub state: BuildState,
    pub graph: PlanGraph,
    /// Commit log, oldest first
    #[serde(default)]
    pub commits: Vec<BuildCommit>,
    pub saved_at: DateTime<Utc>,
}

impl BuildSnapshot {
    pub fn new(state: BuildState, graph: PlanGraph) -> Self {
        Self {
            state,
            graph,
            commits: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot = serde_json::from_str(&content).map_err(|source| PlanError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded build snapshot from {}", path.display());
        Ok(snapshot)
    }

    /// Write the snapshot atomically as pretty JSON
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let io_err = |source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        self.saved_at = Utc::now();
        let content = serde_json::to_string_pretty(self).map_err(|source| PlanError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        log::debug!("Saved build snapshot to {}", path.display());
        Ok(())
    }

    /// The commit that is neither APPLIED nor CANCELLED, if any
    pub fn open_commit(&self) -> Option<&BuildCommit> {
        self.commits.iter().rev().find(|c| !c.state.is_closed())
    }

    pub fn latest_commit(&self) -> Option<&BuildCommit> {
        self.commits.last()
    }

    pub fn commit_mut(&mut self, id: CommitId) -> std::result::Result<&mut BuildCommit, CommitError> {
        self.commits
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CommitError::UnknownCommit(id))
    }

    /// Append a freshly planned commit; only one commit may be open at a time
    pub fn push_commit(&mut self, commit: BuildCommit) -> std::result::Result<CommitId, CommitError> {
        if let Some(open) = self.open_commit() {
            return Err(CommitError::AlreadyOpen { open: open.id });
        }
        let id = commit.id;
        self.commits.push(commit);
        Ok(id)
    }

    /// Run one reconciliation pass over the INPROGRESS commit, if there is one
    pub fn reconcile(
        &mut self,
        reconciler: &Reconciler<'_>,
    ) -> std::result::Result<Option<PassReport>, CommitError> {
        let Some(commit) = self
            .commits
            .iter_mut()
            .rev()
            .find(|c| c.state == CommitState::InProgress)
        else {
            return Ok(None);
        };
        reconciler
            .pass(&mut self.state, &mut self.graph, commit)
            .map(Some)
    }
}
