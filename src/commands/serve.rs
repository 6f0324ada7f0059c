//! `rangectl serve`: control-plane server plus the reconcile loop
//!
//! The server answers agent heartbeats, task pulls and status reports from
//! the task board. Alongside it, every reconcile interval the build snapshot
//! is loaded and one pass runs over its started commit, queueing step tasks
//! on the same board.

use anyhow::{Context as _, Result, bail};
use plangraph::{BuildSnapshot, NoopBuilder, PassReport, Reconciler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use taskwire::{ControlPlaneServer, TaskBoard, TlsFiles};

use crate::Context;
use crate::cli::ServeArgs;
use crate::commands::plan;
use crate::paths;
use crate::ui;

pub const BOARD_FILE: &str = "tasks.json";

pub fn run(ctx: &Context, args: ServeArgs) -> Result<()> {
    let config = &ctx.config.server;
    let listen = args.listen.clone().unwrap_or_else(|| config.listen.clone());
    let board_path = match &args.board {
        Some(path) => path.clone(),
        None => paths::state_file(config.board.as_deref(), BOARD_FILE)?,
    };
    let snapshot_path = plan::snapshot_path(ctx, args.snapshot.clone())?;
    let tls = tls_files(&args, config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let board = TaskBoard::load_or_default(&board_path)
        .with_context(|| format!("Failed to load task board {}", board_path.display()))?;
    let board = Arc::new(board);

    let server = ControlPlaneServer::bind(&listen, tls.as_ref(), Arc::clone(&board))
        .with_context(|| format!("Failed to listen on {listen}"))?
        .with_persistence(board_path.clone());
    let server = Arc::new(server);

    let scheme = if tls.is_some() { "https" } else { "http" };
    let addr = server
        .local_addr()
        .map_or_else(|| listen.clone(), |a| a.to_string());
    if !ctx.quiet {
        ui::header("Control Plane");
        ui::kv("Listening", &format!("{scheme}://{addr}"));
        ui::kv("Task board", &board_path.display().to_string());
        ui::kv("Snapshot", &snapshot_path.display().to_string());
    }
    if tls.is_none() {
        log::warn!("Serving plain HTTP; agents cannot pin a certificate");
    }

    let handle = thread::Builder::new()
        .name("control-plane".to_string())
        .spawn({
            let server = Arc::clone(&server);
            move || server.run()
        })
        .context("Failed to start control-plane thread")?;

    let interval = config.reconcile_interval();
    loop {
        if handle.is_finished() {
            bail!("Control-plane server stopped unexpectedly");
        }

        match reconcile_once(&snapshot_path, &board) {
            Ok(Some(report)) => log_report(&report),
            Ok(None) => log::trace!("No commit in progress"),
            Err(e) => log::error!("Reconcile pass failed: {e:#}"),
        }
        if let Err(e) = board.save(&board_path) {
            log::error!("Failed to persist task board: {e}");
        }

        thread::sleep(interval);
    }
}

/// Flags win over config; `--insecure` drops TLS entirely
fn tls_files(
    args: &ServeArgs,
    cert: Option<&str>,
    key: Option<&str>,
) -> Result<Option<TlsFiles>> {
    if args.insecure {
        return Ok(None);
    }
    let cert = args.tls_cert.clone().or_else(|| cert.map(paths::expand));
    let key = args.tls_key.clone().or_else(|| key.map(paths::expand));
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(TlsFiles { cert, key })),
        (None, None) => Ok(None),
        _ => bail!("TLS needs both a certificate and a private key"),
    }
}

/// Run one pass over the snapshot's started commit and save the result
///
/// Returns `None` when there is no snapshot yet or nothing is in progress.
// TODO: take an advisory lock on the snapshot so `plan approve` cannot race a pass
pub fn reconcile_once(snapshot_path: &Path, board: &TaskBoard) -> Result<Option<PassReport>> {
    if !snapshot_path.exists() {
        return Ok(None);
    }
    let mut snapshot = BuildSnapshot::load(snapshot_path)
        .with_context(|| format!("Failed to load {}", snapshot_path.display()))?;

    let reconciler = Reconciler::new(&NoopBuilder, board);
    let Some(report) = snapshot.reconcile(&reconciler)? else {
        return Ok(None);
    };

    snapshot
        .save(snapshot_path)
        .with_context(|| format!("Failed to save {}", snapshot_path.display()))?;
    Ok(Some(report))
}

fn log_report(report: &PassReport) {
    if report.started + report.completed + report.failed + report.deleted == 0 {
        log::debug!(
            "Pass: {} in flight, {} blocked",
            report.in_flight,
            report.blocked
        );
        return;
    }
    log::info!(
        "Pass: {} started, {} completed, {} failed, {} deleted, {} in flight, {} blocked; commit {}",
        report.started,
        report.completed,
        report.failed,
        report.deleted,
        report.in_flight,
        report.blocked,
        report.commit_state
    );
}
