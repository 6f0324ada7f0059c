//! `rangectl.toml`
//!
//! Every key is optional; command-line flags override what is set here.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8443"
//! tls_cert = "~/range/tls/cert.pem"
//! tls_key = "~/range/tls/key.pem"
//! require_approval = ["DELETE", "REBUILD"]
//!
//! [agent]
//! server = "https://10.0.0.1:8443"
//! ca_cert = "/etc/rangectl/ca.pem"
//! revision_policy = "sequential"
//!
//! [spanner]
//! base_dir = "~/range/teams"
//! teams = 12
//! ```

use crate::paths;
use anyhow::{Context, Result};
use hostagent::RevisionPolicy;
use plangraph::{CommitKind, CommitPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "rangectl.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub spanner: SpannerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Task board file (default: `<state dir>/tasks.json`)
    pub board: Option<String>,
    /// Build snapshot file (default: `<state dir>/build.json`)
    pub snapshot: Option<String>,
    pub reconcile_interval_secs: u64,
    /// Commit kinds that need `plan approve` before they run
    pub require_approval: Vec<CommitKind>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            tls_cert: None,
            tls_key: None,
            board: None,
            snapshot: None,
            reconcile_interval_secs: 5,
            require_approval: CommitPolicy::default().require_approval,
        }
    }
}

impl ServerConfig {
    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            require_approval: self.require_approval.clone(),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the control-plane server
    pub server: String,
    /// PEM certificate the server must present
    pub ca_cert: Option<String>,
    /// This host's ProvisionedHostId
    pub client_id: Option<String>,
    /// Host state file (default: `<state dir>/host-state.json`)
    pub state_file: Option<String>,
    /// Step logs (default: `<state dir>/step-logs`)
    pub log_dir: Option<String>,
    pub diag_listen: String,
    pub heartbeat_interval_secs: u64,
    pub pull_interval_secs: u64,
    pub dedup_window: usize,
    pub revision_policy: RevisionPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "https://127.0.0.1:8443".to_string(),
            ca_cert: None,
            client_id: None,
            state_file: None,
            log_dir: None,
            diag_listen: "127.0.0.1:9191".to_string(),
            heartbeat_interval_secs: 10,
            pull_interval_secs: 10,
            dedup_window: hostagent::recent::DEFAULT_WINDOW,
            revision_policy: RevisionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpannerConfig {
    /// Directory holding one `team-<n>` directory per team
    pub base_dir: Option<String>,
    pub teams: Option<u32>,
    pub log_dir: Option<String>,
}

impl Config {
    /// Load `path`, or `rangectl.toml` in the config directory
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [agent]
            revision_policy = "any-higher"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.reconcile_interval_secs, 5);
        assert_eq!(config.server.require_approval, vec![CommitKind::Delete]);
        assert_eq!(config.agent.revision_policy, RevisionPolicy::AnyHigher);
        assert_eq!(config.agent.heartbeat_interval_secs, 10);
        assert_eq!(config.spanner, SpannerConfig::default());
    }

    #[test]
    fn test_commit_policy_from_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            require_approval = ["DELETE", "REBUILD"]
            reconcile_interval_secs = 0
            "#,
        )
        .unwrap();

        let policy = config.server.commit_policy();
        assert!(policy.requires_approval(CommitKind::Rebuild));
        assert!(!policy.requires_approval(CommitKind::Root));
        assert_eq!(config.server.reconcile_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "[spanner]\nteams = 4\nbase_dir = \"/srv/range\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.spanner.teams, Some(4));
        assert_eq!(config.spanner.base_dir.as_deref(), Some("/srv/range"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let err = Config::load(Some(&temp.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_rejects_unknown_types() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "[spanner]\nteams = \"many\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
