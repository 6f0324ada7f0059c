//! Persisted per-host state
//!
//! The control plane writes one of these for each provisioned host; the
//! worker re-reads it on every accepted `Load` and writes step progress back
//! after each transition so a restarted daemon resumes where it stopped.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use plangraph::{BuildState, ProvisionedHostId, ProvisioningStepId, TaskCommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedHostInfo {
    pub id: ProvisionedHostId,
    #[serde(default)]
    pub subnet_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub revision: u64,
    pub status: BuildStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: ProvisioningStepId,
    pub step_number: u32,
    pub command: TaskCommand,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reboot_after: bool,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepRecord {
    /// REBOOT steps and steps flagged `reboot_after` end with a reboot
    pub fn needs_reboot(&self) -> bool {
        self.reboot_after || self.command == TaskCommand::Reboot
    }
}

/// Reboot requested by a step, identified by the boot it was requested in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReboot {
    pub boot_marker: String,
    pub step: ProvisioningStepId,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub host: HostInfo,
    pub network: NetworkInfo,
    pub environment: String,
    pub competition: String,
    pub team: TeamInfo,
    pub provisioned_host: ProvisionedHostInfo,
    pub build: BuildProgress,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub pending_reboot: Option<PendingReboot>,
}

impl HostState {
    /// Per-host document for `host`, at the build's next revision
    pub fn from_build(state: &BuildState, host: ProvisionedHostId) -> Option<Self> {
        let entry = state.hosts.get(&host)?;
        let network = state.networks.get(&entry.network)?;
        let team = state.teams.get(&network.team)?;
        let steps = state
            .steps_for_host(host)
            .into_iter()
            .map(|step| StepRecord {
                id: step.id,
                step_number: step.step_number,
                command: step.command,
                args: step.args.clone(),
                reboot_after: step.reboot_after,
                status: StepStatus::Pending,
                started_at: None,
                ended_at: None,
                error: None,
            })
            .collect();

        Some(Self {
            host: HostInfo {
                hostname: entry.hostname.clone(),
            },
            network: NetworkInfo {
                name: network.name.clone(),
                cidr: network.cidr.clone(),
            },
            environment: state.build.environment.clone(),
            competition: state.build.competition.clone(),
            team: TeamInfo {
                number: team.team_number,
            },
            provisioned_host: ProvisionedHostInfo {
                id: host,
                subnet_ip: entry.subnet_ip.clone(),
            },
            build: BuildProgress {
                revision: state.build.revision.max(1),
                status: BuildStatus::Pending,
                started_at: None,
                ended_at: None,
                error: None,
            },
            steps,
            pending_reboot: None,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&content).map_err(|source| Error::StateFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write atomically as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|source| Error::StateFile {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
    }

    pub fn step(&self, id: ProvisioningStepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
