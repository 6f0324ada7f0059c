//! HTTP(S) front end for a [`TaskBoard`].
//!
//! Routes:
//! - `POST /v1/heartbeat`: [`Heartbeat`] → [`HeartbeatReply`]
//! - `POST /v1/task`: [`TaskRequest`] → [`TaskReply`]
//! - `POST /v1/status`: [`TaskStatusUpdate`] → [`StatusAck`]

use crate::board::TaskBoard;
use crate::error::{Error, ErrorCategory, Result};
use crate::messages::{ErrorBody, Heartbeat, StatusAck, TaskReply, TaskRequest, TaskStatusUpdate};
use crate::plane::ControlPlane;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, SslConfig};

/// How often the accept loop checks for a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Certificate and private key for HTTPS, both PEM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct ControlPlaneServer {
    server: Server,
    board: Arc<TaskBoard>,
    persist: Option<PathBuf>,
    stop: AtomicBool,
}

impl ControlPlaneServer {
    /// Bind the listener; plain HTTP when `tls` is `None`
    pub fn bind(addr: &str, tls: Option<&TlsFiles>, board: Arc<TaskBoard>) -> Result<Self> {
        let server = match tls {
            Some(files) => {
                let certificate = fs::read(&files.cert).map_err(|e| Error::io(&files.cert, e))?;
                let private_key = fs::read(&files.key).map_err(|e| Error::io(&files.key, e))?;
                Server::https(
                    addr,
                    SslConfig {
                        certificate,
                        private_key,
                    },
                )
            }
            None => Server::http(addr),
        }
        .map_err(|e| Error::Other(format!("failed to bind {addr}: {e}")))?;

        log::info!(
            "Control plane listening on {} ({})",
            addr,
            if tls.is_some() { "https" } else { "http" }
        );
        Ok(Self {
            server,
            board,
            persist: None,
            stop: AtomicBool::new(false),
        })
    }

    /// Save the board to `path` after every request that changes it
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist = Some(path);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    /// Ask [`run`](Self::run) to return after the current request
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.server.unblock();
    }

    /// Serve requests until [`stop`](Self::stop) is called
    pub fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => self.handle(request),
                Ok(None) => {}
                Err(e) => log::warn!("Accept failed: {}", e),
            }
        }
        log::info!("Control plane stopped");
    }

    fn handle(&self, mut request: Request) {
        let mut body = String::new();
        let (status, payload) = match request.as_reader().read_to_string(&mut body) {
            Ok(_) => route(&self.board, request.method(), request.url(), &body),
            Err(e) => error_response(400, &format!("unreadable body: {e}")),
        };
        log::debug!("{} {} -> {}", request.method(), request.url(), status);

        if status == 200
            && request.url() != "/v1/heartbeat"
            && let Some(path) = &self.persist
            && let Err(e) = self.board.save(path)
        {
            log::error!("Failed to persist task board: {}", e);
        }

        let mut response = Response::from_string(payload).with_status_code(status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            log::warn!("Failed to send response: {}", e);
        }
    }
}

fn json<T: Serialize>(value: &T) -> (u16, String) {
    match serde_json::to_string(value) {
        Ok(body) => (200, body),
        Err(e) => error_response(500, &e.to_string()),
    }
}

fn error_response(status: u16, message: &str) -> (u16, String) {
    let body = serde_json::to_string(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_default();
    (status, body)
}

fn status_for(err: &Error) -> u16 {
    match err.category() {
        ErrorCategory::NotFound => 404,
        ErrorCategory::Protocol => match err {
            Error::InvalidTransition { .. } => 409,
            _ => 400,
        },
        _ => 500,
    }
}

fn reply<T: Serialize>(result: Result<T>) -> (u16, String) {
    match result {
        Ok(value) => json(&value),
        Err(e) => {
            log::warn!("Request rejected: {}", e);
            error_response(status_for(&e), &e.to_string())
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

/// Dispatch one request against the board; returns status code and JSON body
pub fn route(board: &TaskBoard, method: &Method, url: &str, body: &str) -> (u16, String) {
    let path = url.split('?').next().unwrap_or(url);
    if !matches!(path, "/v1/heartbeat" | "/v1/task" | "/v1/status") {
        return error_response(404, &format!("no route for {path}"));
    }
    if *method != Method::Post {
        return error_response(405, &format!("{method} not allowed on {path}"));
    }

    match path {
        "/v1/heartbeat" => reply(parse::<Heartbeat>(body).and_then(|b| board.heartbeat(&b))),
        "/v1/task" => reply(
            parse::<TaskRequest>(body)
                .and_then(|r| board.get_task(&r.client_id))
                .map(|task| TaskReply { task }),
        ),
        _ => reply(
            parse::<TaskStatusUpdate>(body)
                .and_then(|u| board.inform_task_status(&u))
                .map(|()| StatusAck { ok: true }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpControlPlane;
    use crate::messages::HeartbeatReply;
    use crate::task::TaskState;
    use plangraph::{ProvisionedHostId, TaskCommand};
    use std::thread;

    #[test]
    fn test_route_task_pull() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let id = board.enqueue(host, None, TaskCommand::Execute, vec!["ls".into()]);

        let body = format!(r#"{{"client_id":"{host}"}}"#);
        let (status, payload) = route(&board, &Method::Post, "/v1/task", &body);
        assert_eq!(status, 200);
        let reply: TaskReply = serde_json::from_str(&payload).unwrap();
        assert_eq!(reply.task.unwrap().task_id, id);
    }

    #[test]
    fn test_route_errors() {
        let board = TaskBoard::new();
        assert_eq!(route(&board, &Method::Post, "/nope", "{}").0, 404);
        assert_eq!(route(&board, &Method::Get, "/v1/task", "").0, 405);
        assert_eq!(route(&board, &Method::Post, "/v1/task", "not json").0, 400);
        let unknown = format!(
            r#"{{"task_id":"{}","status":"COMPLETE"}}"#,
            plangraph::TaskId::new()
        );
        assert_eq!(route(&board, &Method::Post, "/v1/status", &unknown).0, 404);
    }

    #[test]
    fn test_route_rejects_backwards_transition() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let id = board.enqueue(host, None, TaskCommand::Execute, vec![]);
        let body = format!(r#"{{"task_id":"{id}","status":"COMPLETE"}}"#);
        assert_eq!(route(&board, &Method::Post, "/v1/status", &body).0, 409);
    }

    #[test]
    fn test_loopback_round_trip() {
        let board = Arc::new(TaskBoard::new());
        let server = Arc::new(ControlPlaneServer::bind("127.0.0.1:0", None, board.clone()).unwrap());
        let addr = server.local_addr().unwrap();
        let runner = {
            let server = server.clone();
            thread::spawn(move || server.run())
        };

        let host = ProvisionedHostId::new();
        let id = board.enqueue(host, None, TaskCommand::Execute, vec!["true".into()]);
        let client = HttpControlPlane::new(format!("http://{addr}"));

        let assignment = client.get_task(&host.to_string()).unwrap().unwrap();
        assert_eq!(assignment.task_id, id);
        assert_eq!(assignment.args, vec!["true".to_string()]);
        client
            .inform_task_status(&TaskStatusUpdate::claim(id))
            .unwrap();
        client
            .inform_task_status(&TaskStatusUpdate::complete(id, "ok"))
            .unwrap();
        assert_eq!(board.task(id).unwrap().state, TaskState::Complete);

        let beat = Heartbeat {
            client_id: host.to_string(),
            hostname: "web".into(),
            uptime: 1,
            boot_time: 1,
            proc_count: 1,
            os: "linux".into(),
            load1: 0.0,
            load5: 0.0,
            load15: 0.0,
            mem_total: 1,
            mem_free: 1,
            mem_used: 0,
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(
            client.heartbeat(&beat).unwrap(),
            HeartbeatReply {
                available_tasks: false
            }
        );

        server.stop();
        runner.join().unwrap();
    }
}
