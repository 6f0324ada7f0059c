//! Local diagnostics over HTTP
//!
//! Routes:
//! - `GET /api/status` worker phase, revision, liveness and step counts
//! - `GET /api/state` the loaded state document
//! - `GET /api/steps`, `GET /api/steps/:id`
//! - `GET /api/logs/stdout/:id`, `GET /api/logs/stderr/:id` (plain text)
//! - `POST /api/self-destruct`

use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::statefile::StepStatus;
use crate::worker::{LogStream, Worker, WorkerPhase, WorkerSnapshot, step_log_path};
use chrono::{DateTime, Utc};
use plangraph::ProvisioningStepId;
use serde::Serialize;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use taskwire::messages::ErrorBody;
use tiny_http::{Header, Method, Request, Response, Server};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Removes the agent from the host when asked over the diagnostics API
pub trait SelfDestruct: Send + Sync {
    fn self_destruct(&self) -> anyhow::Result<()>;
}

/// Deletes the agent's files and stops its loops
pub struct RemoveAgentFiles {
    pub paths: Vec<PathBuf>,
    pub shutdown: Shutdown,
}

impl SelfDestruct for RemoveAgentFiles {
    fn self_destruct(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        log::warn!("Self-destruct requested");
        for path in &self.paths {
            let removed = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        self.shutdown.trigger();
        Ok(())
    }
}

/// Everything the routes read
#[derive(Clone)]
pub struct DiagContext {
    pub snapshot: Arc<RwLock<WorkerSnapshot>>,
    pub liveness: Arc<AtomicI64>,
    pub log_dir: PathBuf,
    pub self_destruct: Arc<dyn SelfDestruct>,
}

impl DiagContext {
    pub fn for_worker(worker: &Worker, self_destruct: Arc<dyn SelfDestruct>) -> Self {
        Self {
            snapshot: worker.shared_snapshot(),
            liveness: worker.liveness(),
            log_dir: worker.log_dir().to_path_buf(),
            self_destruct,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBody {
    pub phase: WorkerPhase,
    pub revision: Option<u64>,
    pub current_step: Option<ProvisioningStepId>,
    pub last_alive: i64,
    pub updated_at: DateTime<Utc>,
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Status, body and content type of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
}

impl Reply {
    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => Self {
                status: 200,
                body,
                content_type: "application/json",
            },
            Err(e) => Self::error(500, &e.to_string()),
        }
    }

    fn text(body: String) -> Self {
        Self {
            status: 200,
            body,
            content_type: "text/plain; charset=utf-8",
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: serde_json::to_string(&ErrorBody {
                error: message.to_string(),
            })
            .unwrap_or_default(),
            content_type: "application/json",
        }
    }
}

fn step_id(raw: &str) -> std::result::Result<ProvisioningStepId, Reply> {
    raw.parse()
        .map_err(|_| Reply::error(400, &format!("invalid step id: {raw}")))
}

/// Answer one request from the context
pub fn route(ctx: &DiagContext, method: &Method, url: &str) -> Reply {
    let path = url.split('?').next().unwrap_or(url);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (Method::Get, ["api", "status"]) => {
            let snapshot = ctx.snapshot();
            let steps = snapshot.state.as_ref().map(|s| s.steps.as_slice()).unwrap_or(&[]);
            let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
            Reply::json(&StatusBody {
                phase: snapshot.phase,
                revision: snapshot.revision,
                current_step: snapshot.current_step,
                last_alive: ctx.liveness.load(Ordering::Relaxed),
                updated_at: snapshot.updated_at,
                total: steps.len(),
                complete: count(StepStatus::Complete),
                failed: count(StepStatus::Failed),
                pending: count(StepStatus::Pending),
            })
        }
        (Method::Get, ["api", "state"]) => match ctx.snapshot().state {
            Some(state) => Reply::json(&state),
            None => Reply::error(404, "no state loaded"),
        },
        (Method::Get, ["api", "steps"]) => {
            let steps = ctx.snapshot().state.map(|s| s.steps).unwrap_or_default();
            Reply::json(&steps)
        }
        (Method::Get, ["api", "steps", raw]) => {
            let id = match step_id(raw) {
                Ok(id) => id,
                Err(reply) => return reply,
            };
            match ctx.snapshot().state.as_ref().and_then(|s| s.step(id)) {
                Some(step) => Reply::json(step),
                None => Reply::error(404, &format!("no step {id}")),
            }
        }
        (Method::Get, ["api", "logs", stream, raw]) => {
            let Some(stream) = LogStream::parse(stream) else {
                return Reply::error(404, &format!("no log stream {stream}"));
            };
            let id = match step_id(raw) {
                Ok(id) => id,
                Err(reply) => return reply,
            };
            let file = step_log_path(&ctx.log_dir, id, stream);
            match fs::read_to_string(&file) {
                Ok(content) => Reply::text(content),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Reply::error(404, &format!("no {} log for step {id}", stream.as_str()))
                }
                Err(e) => Reply::error(500, &e.to_string()),
            }
        }
        (Method::Post, ["api", "self-destruct"]) => match ctx.self_destruct.self_destruct() {
            Ok(()) => Reply::json(&taskwire::StatusAck { ok: true }),
            Err(e) => Reply::error(500, &format!("{e:#}")),
        },
        (_, ["api", "status" | "state" | "steps" | "logs" | "self-destruct", ..]) => {
            Reply::error(405, &format!("{method} not allowed on {path}"))
        }
        _ => Reply::error(404, &format!("no route for {path}")),
    }
}

pub struct DiagServer {
    server: Server,
    context: DiagContext,
    stop: AtomicBool,
}

impl DiagServer {
    pub fn bind(addr: &str, context: DiagContext) -> Result<Self> {
        let server = Server::http(addr)
            .map_err(|e| Error::Diagnostics(format!("failed to bind {addr}: {e}")))?;
        log::info!("Diagnostics listening on {addr}");
        Ok(Self {
            server,
            context,
            stop: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.server.unblock();
    }

    pub fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => self.handle(request),
                Ok(None) => {}
                Err(e) => log::warn!("Accept failed: {e}"),
            }
        }
    }

    fn handle(&self, request: Request) {
        let reply = route(&self.context, request.method(), request.url());
        log::debug!("{} {} -> {}", request.method(), request.url(), reply.status);

        let mut response = Response::from_string(reply.body).with_status_code(reply.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()) {
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            log::warn!("Failed to send response: {e}");
        }
    }
}
