//! `rangectl agent`: the per-host daemon
//!
//! Three pieces run side by side until a self-destruct request stops them:
//! the task dispatcher (heartbeat and pull loops against the control plane),
//! the step worker fed from the host state file, and the local diagnostics
//! server.

use anyhow::{Context as _, Result};
use hostagent::{
    CommandExecutor, DiagContext, DiagServer, Dispatcher, HostState, LoadError, Platform,
    RemoveAgentFiles, SerialRunner, Shutdown, StepRunner, SystemPlatform, Worker, WorkerTimings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use taskwire::{ControlPlane, HttpControlPlane};

use crate::Context;
use crate::cli::AgentArgs;
use crate::paths;
use crate::ui;

pub const STATE_FILE: &str = "host-state.json";
pub const LOG_DIR: &str = "step-logs";

/// How often the state file is checked for a new revision
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

pub fn run(ctx: &Context, args: AgentArgs) -> Result<()> {
    let config = &ctx.config.agent;
    let client_id = args
        .client_id
        .or_else(|| config.client_id.clone())
        .context("No client id; pass --client-id or set [agent] client_id")?;
    let server = args.server.unwrap_or_else(|| config.server.clone());
    let ca_cert = args
        .ca_cert
        .or_else(|| config.ca_cert.as_deref().map(paths::expand));
    let state_file = match args.state_file {
        Some(path) => path,
        None => paths::state_file(config.state_file.as_deref(), STATE_FILE)?,
    };
    let log_dir = match args.log_dir {
        Some(path) => path,
        None => paths::state_file(config.log_dir.as_deref(), LOG_DIR)?,
    };

    let plane: Arc<dyn ControlPlane> = match &ca_cert {
        Some(pem) => Arc::new(
            HttpControlPlane::with_pinned_cert(server.clone(), pem)
                .with_context(|| format!("Failed to pin certificate {}", pem.display()))?,
        ),
        None => Arc::new(HttpControlPlane::new(server.clone())),
    };
    let platform: Arc<dyn Platform> = Arc::new(SystemPlatform);
    // Ad-hoc tasks and the step loop take turns on the host
    let runner: Arc<dyn StepRunner> = Arc::new(SerialRunner::new(Arc::new(
        CommandExecutor::new(Arc::clone(&platform)),
    )));

    let mut agent_config = hostagent::AgentConfig::new(client_id.clone());
    agent_config.heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    agent_config.pull_interval = Duration::from_secs(config.pull_interval_secs.max(1));
    agent_config.dedup_window = config.dedup_window;

    let shutdown = Shutdown::new();
    let dispatcher = Arc::new(Dispatcher::new(
        plane,
        Arc::clone(&runner),
        Arc::clone(&platform),
        agent_config,
    ));
    let mut handles = dispatcher.spawn(&shutdown);

    let worker = Worker::spawn(
        runner,
        platform,
        WorkerTimings::default(),
        config.revision_policy,
        &log_dir,
    );

    let diag = if args.no_diag {
        None
    } else {
        let listen = args.diag_listen.unwrap_or_else(|| config.diag_listen.clone());
        let self_destruct = Arc::new(RemoveAgentFiles {
            paths: vec![state_file.clone(), log_dir.clone()],
            shutdown: shutdown.clone(),
        });
        let server = DiagServer::bind(&listen, DiagContext::for_worker(&worker, self_destruct))
            .with_context(|| format!("Failed to start diagnostics on {listen}"))?;
        let server = Arc::new(server);
        handles.push(spawn_diag(Arc::clone(&server))?);
        Some(server)
    };

    if !ctx.quiet {
        ui::header("Host Agent");
        ui::kv("Client", &client_id);
        ui::kv("Control plane", &server);
        ui::kv("State file", &state_file.display().to_string());
        ui::kv("Step logs", &log_dir.display().to_string());
        if let Some(addr) = diag.as_ref().and_then(|d| d.local_addr()) {
            ui::kv("Diagnostics", &format!("http://{addr}/api/status"));
        }
    }

    let mut watcher = StateWatcher::new(state_file);
    watcher.poll(&worker);
    while !shutdown.wait(WATCH_INTERVAL) {
        watcher.poll(&worker);
    }

    log::info!("Agent shutting down");
    if let Some(diag) = &diag {
        diag.stop();
    }
    worker.stop();
    for handle in handles {
        if handle.join().is_err() {
            log::warn!("An agent thread panicked during shutdown");
        }
    }
    Ok(())
}

fn spawn_diag(server: Arc<DiagServer>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("diagnostics".to_string())
        .spawn(move || server.run())
        .context("Failed to start diagnostics thread")
}

/// Feeds the host state file to the worker whenever its revision moves up
pub struct StateWatcher {
    path: PathBuf,
    loaded: Option<u64>,
    rejected: Option<u64>,
}

impl StateWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: None,
            rejected: None,
        }
    }

    /// Try to load the file; returns the revision this poll loaded
    ///
    /// The worker saves its progress into the same file, so only a revision
    /// above the loaded one triggers a load. A busy or slow worker is retried
    /// on the next poll; a rejected revision is not retried.
    pub fn poll(&mut self, worker: &Worker) -> Option<u64> {
        if !self.path.exists() {
            return None;
        }
        let revision = match HostState::load(&self.path) {
            Ok(state) => state.build.revision,
            Err(e) => {
                log::warn!("Cannot read {}: {e}", self.path.display());
                return None;
            }
        };
        if self.loaded.is_some_and(|loaded| revision <= loaded) || self.rejected == Some(revision)
        {
            return None;
        }

        match worker.load(&self.path) {
            Ok(loaded) => {
                log::debug!("Watcher handed revision {loaded} to the worker");
                self.loaded = Some(loaded);
                Some(loaded)
            }
            Err(LoadError::WorkerBusy | LoadError::LoadTimedOut) => {
                log::debug!("Worker busy; retrying revision {revision}");
                None
            }
            Err(LoadError::DuplicateRevision { revision }) => {
                self.loaded = Some(revision);
                None
            }
            Err(e) => {
                log::warn!("Revision {revision} rejected: {e}");
                self.rejected = Some(revision);
                None
            }
        }
    }
}
