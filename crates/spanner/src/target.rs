//! Where a team's copy of the command runs
//!
//! Local targets run inside the team directory on the control host. Remote
//! targets are resolved from the team's build snapshot: the host must have
//! finished provisioning and carry connection facts.

use crate::error::{Error, Result};
use plangraph::{BuildSnapshot, ConnectionInfo, PlanKind, StatusState, Transport};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Build snapshot file inside a team directory
pub const SNAPSHOT_FILE: &str = "build.json";

/// Environment variable carrying the WinRM password to `pwsh`
pub const WINRM_PASSWORD_ENV: &str = "RANGECTL_WINRM_PASSWORD";

/// Environment variable carrying the command text to `pwsh`
pub const WINRM_COMMAND_ENV: &str = "RANGECTL_SPAN_COMMAND";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanMode {
    /// Run on the control host inside each team directory
    Local,
    /// Run on the named host of every team
    Remote { hostname: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote {
        hostname: String,
        connection: ConnectionInfo,
    },
}

pub fn team_dir(base_dir: &Path, team: u32) -> PathBuf {
    base_dir.join(format!("team-{team}"))
}

/// Resolve the named host of `team` from its snapshot, failing unless active
pub fn resolve_remote(team: u32, team_dir: &Path, hostname: &str) -> Result<Target> {
    let path = team_dir.join(SNAPSHOT_FILE);
    let snapshot =
        BuildSnapshot::load(&path).map_err(|source| Error::Snapshot { team, source })?;

    let team_entry = snapshot
        .state
        .team_by_number(team)
        .ok_or_else(|| Error::UnknownTeam {
            team,
            path: path.clone(),
        })?;
    let host = snapshot
        .state
        .host_in_team(team_entry.id, hostname)
        .ok_or_else(|| Error::UnknownHost {
            team,
            hostname: hostname.to_string(),
        })?;

    let inactive = |reason: String| Error::HostNotActive {
        team,
        hostname: hostname.to_string(),
        reason,
    };
    let node = snapshot
        .graph
        .find(&PlanKind::ProvisionHost { host: host.id })
        .and_then(|id| snapshot.graph.node(id).ok())
        .ok_or_else(|| inactive("not in the plan".to_string()))?;
    if node.status.state != StatusState::Complete {
        return Err(inactive(format!("provisioning is {}", node.status.state)));
    }
    let connection = host
        .connection
        .clone()
        .ok_or_else(|| inactive("no connection info".to_string()))?;

    log::debug!(
        "Team {team}: {hostname} at {} over {:?}",
        connection.address,
        connection.transport
    );
    Ok(Target::Remote {
        hostname: hostname.to_string(),
        connection,
    })
}

impl Target {
    /// Process that runs `command` against this target
    pub fn command(&self, command: &str, team_dir: &Path) -> Command {
        match self {
            Self::Local => local_command(command, team_dir),
            Self::Remote { connection, .. } => match connection.transport {
                Transport::Ssh => ssh_command(command, connection),
                Transport::WinRm => winrm_command(command, connection),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::Remote {
                hostname,
                connection,
            } => format!("{hostname} ({})", connection.address),
        }
    }
}

fn local_command(command: &str, team_dir: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd.current_dir(team_dir);
    cmd
}

fn ssh_command(command: &str, conn: &ConnectionInfo) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]);
    if let Some(identity) = &conn.identity_file {
        let identity = shellexpand::tilde(identity);
        cmd.arg("-i").arg(identity.as_ref());
    }
    if let Some(port) = conn.port {
        cmd.arg("-p").arg(port.to_string());
    }
    cmd.arg(format!("{}@{}", conn.user, conn.address));
    cmd.arg("--").arg(command);
    cmd
}

fn winrm_command(command: &str, conn: &ConnectionInfo) -> Command {
    let port = conn.port.unwrap_or(5985);
    let script = format!(
        "$ErrorActionPreference = 'Stop'; \
         $pass = ConvertTo-SecureString $env:{WINRM_PASSWORD_ENV} -AsPlainText -Force; \
         $cred = New-Object System.Management.Automation.PSCredential('{user}', $pass); \
         Invoke-Command -ComputerName '{address}' -Port {port} -Credential $cred \
         -ScriptBlock ([scriptblock]::Create($env:{WINRM_COMMAND_ENV}))",
        user = conn.user.replace('\'', "''"),
        address = conn.address.replace('\'', "''"),
    );

    let mut cmd = Command::new("pwsh");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
    cmd.env(WINRM_COMMAND_ENV, command);
    cmd.env(WINRM_PASSWORD_ENV, conn.password.as_deref().unwrap_or_default());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use plangraph::{BuildState, PlanBuilder};
    use std::ffi::OsStr;
    use tempfile::TempDir;

    fn conn(transport: Transport) -> ConnectionInfo {
        ConnectionInfo {
            address: "10.1.0.5".into(),
            transport,
            port: Some(2222),
            user: "admin".into(),
            identity_file: Some("/keys/range".into()),
            password: Some("hunter2".into()),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Snapshot for `team` with host "dc"; provisioned up to the host when `active`
    fn write_snapshot(dir: &Path, team: u32, active: bool, connection: Option<ConnectionInfo>) {
        let mut state = BuildState::new("range", "finals");
        let team_id = state.add_team(team);
        let net = state.add_network(team_id, "lan", "10.1.0.0/24").unwrap();
        let host = state.add_host(net, "dc").unwrap();
        state.hosts.get_mut(&host).unwrap().connection = connection;

        let mut graph = PlanBuilder::from_state(&state).unwrap();
        if active {
            for id in graph.traverse() {
                graph.start(id).unwrap();
                graph.complete(id).unwrap();
            }
        }
        BuildSnapshot::new(state, graph)
            .save(&dir.join(SNAPSHOT_FILE))
            .unwrap();
    }

    #[test]
    fn test_ssh_command_line() {
        let target = Target::Remote {
            hostname: "dc".into(),
            connection: conn(Transport::Ssh),
        };
        let cmd = target.command("uptime", Path::new("/tmp"));
        assert_eq!(cmd.get_program(), OsStr::new("ssh"));
        let args = args(&cmd);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/range"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert_eq!(&args[args.len() - 3..], ["admin@10.1.0.5", "--", "uptime"]);
    }

    #[test]
    fn test_winrm_keeps_secrets_off_the_command_line() {
        let target = Target::Remote {
            hostname: "dc".into(),
            connection: conn(Transport::WinRm),
        };
        let cmd = target.command("Get-Date", Path::new("/tmp"));
        assert_eq!(cmd.get_program(), OsStr::new("pwsh"));
        let joined = args(&cmd).join(" ");
        assert!(joined.contains("Invoke-Command -ComputerName '10.1.0.5' -Port 2222"));
        assert!(!joined.contains("hunter2"));
        assert!(!joined.contains("Get-Date"));

        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&(OsStr::new(WINRM_PASSWORD_ENV), Some(OsStr::new("hunter2")))));
        assert!(envs.contains(&(OsStr::new(WINRM_COMMAND_ENV), Some(OsStr::new("Get-Date")))));
    }

    #[test]
    fn test_resolve_active_host() {
        let temp = TempDir::new().unwrap();
        write_snapshot(temp.path(), 2, true, Some(conn(Transport::Ssh)));
        let target = resolve_remote(2, temp.path(), "dc").unwrap();
        assert_eq!(
            target,
            Target::Remote {
                hostname: "dc".into(),
                connection: conn(Transport::Ssh)
            }
        );
    }

    #[test]
    fn test_resolve_fails_fast() {
        let temp = TempDir::new().unwrap();
        write_snapshot(temp.path(), 2, false, Some(conn(Transport::Ssh)));
        assert!(matches!(
            resolve_remote(2, temp.path(), "dc"),
            Err(Error::HostNotActive { .. })
        ));
        assert!(matches!(
            resolve_remote(2, temp.path(), "web"),
            Err(Error::UnknownHost { .. })
        ));
        assert!(matches!(
            resolve_remote(3, temp.path(), "dc"),
            Err(Error::UnknownTeam { .. })
        ));

        write_snapshot(temp.path(), 2, true, None);
        assert!(matches!(
            resolve_remote(2, temp.path(), "dc"),
            Err(Error::HostNotActive { .. })
        ));

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            resolve_remote(1, empty.path(), "dc"),
            Err(Error::Snapshot { .. })
        ));
    }
}
