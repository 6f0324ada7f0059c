//! Build scoping entities
//!
//! A build is scoped as Build → Team → ProvisionedNetwork → ProvisionedHost →
//! ProvisioningStep. [`BuildState`] owns all of them for one build and is
//! what the plan graph references by id.

use crate::error::{PlanError, Result};
use crate::ids::{BuildId, ProvisionedHostId, ProvisionedNetworkId, ProvisioningStepId, TeamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Command a provisioning step resolves to on the target host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskCommand {
    Execute,
    Download,
    Extract,
    Delete,
    Reboot,
    CreateUser,
    CreateUserPass,
    AddToGroup,
    Validate,
    ChangePerms,
    AppendFile,
    Default,
}

impl TaskCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "EXECUTE",
            Self::Download => "DOWNLOAD",
            Self::Extract => "EXTRACT",
            Self::Delete => "DELETE",
            Self::Reboot => "REBOOT",
            Self::CreateUser => "CREATEUSER",
            Self::CreateUserPass => "CREATEUSERPASS",
            Self::AddToGroup => "ADDTOGROUP",
            Self::Validate => "VALIDATE",
            Self::ChangePerms => "CHANGEPERMS",
            Self::AppendFile => "APPENDFILE",
            Self::Default => "DEFAULT",
        }
    }
}

impl fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the control host reaches a provisioned host for ad hoc commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ssh,
    #[serde(rename = "winrm")]
    WinRm,
}

/// Connection facts for a provisioned host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub transport: Transport,
    #[serde(default)]
    pub port: Option<u16>,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    /// Revision of the last applied commit (0 before the first apply)
    #[serde(default)]
    pub revision: u64,
    pub environment: String,
    pub competition: String,
    #[serde(default)]
    pub teams: Vec<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub build: BuildId,
    pub team_number: u32,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub networks: Vec<ProvisionedNetworkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNetwork {
    pub id: ProvisionedNetworkId,
    pub team: TeamId,
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub hosts: Vec<ProvisionedHostId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedHost {
    pub id: ProvisionedHostId,
    pub network: ProvisionedNetworkId,
    pub hostname: String,
    #[serde(default)]
    pub subnet_ip: Option<String>,
    #[serde(default)]
    pub revision: u64,
    /// Hostnames in the same team that must be provisioned first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
    #[serde(default)]
    pub steps: Vec<ProvisioningStepId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningStep {
    pub id: ProvisioningStepId,
    pub host: ProvisionedHostId,
    pub step_number: u32,
    pub command: TaskCommand,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reboot_after: bool,
    #[serde(default)]
    pub revision: u64,
}

impl ProvisioningStep {
    /// Content fingerprint used to detect changed steps on rebuild
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.command.as_str().as_bytes());
        for arg in &self.args {
            hasher.update(&(arg.len() as u64).to_le_bytes());
            hasher.update(arg.as_bytes());
        }
        hasher.update(&[u8::from(self.reboot_after)]);
        hasher.finalize().to_hex().to_string()
    }
}

/// All scoping entities of one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub build: Build,
    #[serde(default)]
    pub teams: BTreeMap<TeamId, Team>,
    #[serde(default)]
    pub networks: BTreeMap<ProvisionedNetworkId, ProvisionedNetwork>,
    #[serde(default)]
    pub hosts: BTreeMap<ProvisionedHostId, ProvisionedHost>,
    #[serde(default)]
    pub steps: BTreeMap<ProvisioningStepId, ProvisioningStep>,
}

impl BuildState {
    pub fn new(environment: impl Into<String>, competition: impl Into<String>) -> Self {
        Self {
            build: Build {
                id: BuildId::new(),
                revision: 0,
                environment: environment.into(),
                competition: competition.into(),
                teams: Vec::new(),
            },
            teams: BTreeMap::new(),
            networks: BTreeMap::new(),
            hosts: BTreeMap::new(),
            steps: BTreeMap::new(),
        }
    }

    pub fn add_team(&mut self, team_number: u32) -> TeamId {
        let id = TeamId::new();
        self.teams.insert(
            id,
            Team {
                id,
                build: self.build.id,
                team_number,
                revision: 0,
                networks: Vec::new(),
            },
        );
        self.build.teams.push(id);
        id
    }

    pub fn add_network(
        &mut self,
        team: TeamId,
        name: impl Into<String>,
        cidr: impl Into<String>,
    ) -> Result<ProvisionedNetworkId> {
        let id = ProvisionedNetworkId::new();
        self.teams
            .get_mut(&team)
            .ok_or_else(|| unknown("team", team))?
            .networks
            .push(id);
        self.networks.insert(
            id,
            ProvisionedNetwork {
                id,
                team,
                name: name.into(),
                cidr: cidr.into(),
                revision: 0,
                hosts: Vec::new(),
            },
        );
        Ok(id)
    }

    pub fn add_host(
        &mut self,
        network: ProvisionedNetworkId,
        hostname: impl Into<String>,
    ) -> Result<ProvisionedHostId> {
        let id = ProvisionedHostId::new();
        self.networks
            .get_mut(&network)
            .ok_or_else(|| unknown("network", network))?
            .hosts
            .push(id);
        self.hosts.insert(
            id,
            ProvisionedHost {
                id,
                network,
                hostname: hostname.into(),
                subnet_ip: None,
                revision: 0,
                depends_on: Vec::new(),
                connection: None,
                steps: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Append a step to a host; step numbers follow insertion order
    pub fn add_step(
        &mut self,
        host: ProvisionedHostId,
        command: TaskCommand,
        args: Vec<String>,
    ) -> Result<ProvisioningStepId> {
        let id = ProvisioningStepId::new();
        let entry = self
            .hosts
            .get_mut(&host)
            .ok_or_else(|| unknown("host", host))?;
        let step_number = entry.steps.len() as u32;
        entry.steps.push(id);
        self.steps.insert(
            id,
            ProvisioningStep {
                id,
                host,
                step_number,
                command,
                args,
                reboot_after: false,
                revision: 0,
            },
        );
        Ok(id)
    }

    /// Teams ordered by team number
    pub fn teams_ordered(&self) -> Vec<&Team> {
        let mut teams: Vec<&Team> = self.teams.values().collect();
        teams.sort_by_key(|t| t.team_number);
        teams
    }

    pub fn team_by_number(&self, team_number: u32) -> Option<&Team> {
        self.teams.values().find(|t| t.team_number == team_number)
    }

    /// Team that owns a host
    pub fn team_of_host(&self, host: ProvisionedHostId) -> Option<&Team> {
        let host = self.hosts.get(&host)?;
        let network = self.networks.get(&host.network)?;
        self.teams.get(&network.team)
    }

    /// Find a host by hostname within one team
    pub fn host_in_team(&self, team: TeamId, hostname: &str) -> Option<&ProvisionedHost> {
        self.hosts.values().find(|h| {
            h.hostname == hostname
                && self
                    .networks
                    .get(&h.network)
                    .is_some_and(|n| n.team == team)
        })
    }

    /// Steps of a host ordered by step number
    pub fn steps_for_host(&self, host: ProvisionedHostId) -> Vec<&ProvisioningStep> {
        let mut steps: Vec<&ProvisioningStep> =
            self.steps.values().filter(|s| s.host == host).collect();
        steps.sort_by_key(|s| s.step_number);
        steps
    }
}

fn unknown(kind: &'static str, id: impl fmt::Display) -> PlanError {
    PlanError::UnknownEntity {
        kind,
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_lookup() {
        let mut state = BuildState::new("env", "comp");
        let team = state.add_team(1);
        let net = state.add_network(team, "vdi", "10.0.1.0/24").unwrap();
        let host = state.add_host(net, "web").unwrap();
        state
            .add_step(host, TaskCommand::Execute, vec!["true".into()])
            .unwrap();
        state.add_step(host, TaskCommand::Reboot, vec![]).unwrap();

        assert_eq!(state.team_of_host(host).unwrap().team_number, 1);
        assert_eq!(state.host_in_team(team, "web").unwrap().id, host);
        let steps = state.steps_for_host(host);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step_number, 1);
        assert_eq!(steps[1].command, TaskCommand::Reboot);
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut state = BuildState::new("env", "comp");
        assert!(state.add_network(TeamId::new(), "n", "10.0.0.0/24").is_err());
        assert!(state.add_host(ProvisionedNetworkId::new(), "h").is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut state = BuildState::new("env", "comp");
        let team = state.add_team(1);
        let net = state.add_network(team, "n", "10.0.0.0/24").unwrap();
        let host = state.add_host(net, "h").unwrap();
        let id = state
            .add_step(host, TaskCommand::Execute, vec!["a".into(), "b".into()])
            .unwrap();

        let step = state.steps[&id].clone();
        let mut changed = step.clone();
        changed.args = vec!["ab".into()];
        assert_ne!(step.fingerprint(), changed.fingerprint());
        assert_eq!(step.fingerprint(), step.clone().fingerprint());
    }

    #[test]
    fn test_command_wire_names() {
        let json = serde_json::to_string(&TaskCommand::CreateUserPass).unwrap();
        assert_eq!(json, "\"CREATEUSERPASS\"");
        let parsed: TaskCommand = serde_json::from_str("\"APPENDFILE\"").unwrap();
        assert_eq!(parsed, TaskCommand::AppendFile);
    }
}
