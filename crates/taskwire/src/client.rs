//! HTTPS control plane client.
//!
//! JSON over HTTPS with `ureq`. The agent authenticates the server by pinning
//! its certificate: the only trusted root is the PEM file it was given.

use crate::error::{Error, Result};
use crate::messages::{
    Heartbeat, HeartbeatReply, StatusAck, TaskAssignment, TaskReply, TaskRequest,
    TaskStatusUpdate,
};
use crate::plane::ControlPlane;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ureq::tls::{Certificate, RootCerts, TlsConfig};

const USER_AGENT: &str = concat!("rangectl-agent/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpControlPlane {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpControlPlane {
    /// Client trusting the platform's default roots.
    pub fn new(base_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            base_url: normalize_base(base_url.into()),
        }
    }

    /// Client that trusts only the certificate in `pem_path`.
    pub fn with_pinned_cert(base_url: impl Into<String>, pem_path: &Path) -> Result<Self> {
        let pem = fs::read(pem_path).map_err(|e| Error::io(pem_path, e))?;
        let cert = Certificate::from_pem(&pem).map_err(|e| Error::Tls(e.to_string()))?;
        let tls = TlsConfig::builder()
            .root_certs(RootCerts::Specific(Arc::new(vec![cert])))
            .build();
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .tls_config(tls)
            .build();
        log::debug!("Pinned control plane certificate {}", pem_path.display());
        Ok(Self {
            agent: ureq::Agent::new_with_config(config),
            base_url: normalize_base(base_url.into()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let reply: R = self
            .agent
            .post(&url)
            .header("User-Agent", USER_AGENT)
            .send_json(body)?
            .body_mut()
            .read_json()?;
        Ok(reply)
    }
}

fn normalize_base(mut base: String) -> String {
    while base.ends_with('/') {
        base.pop();
    }
    base
}

impl ControlPlane for HttpControlPlane {
    fn heartbeat(&self, beat: &Heartbeat) -> Result<HeartbeatReply> {
        self.post("/v1/heartbeat", beat)
    }

    fn get_task(&self, client_id: &str) -> Result<Option<TaskAssignment>> {
        let reply: TaskReply = self.post(
            "/v1/task",
            &TaskRequest {
                client_id: client_id.to_string(),
            },
        )?;
        Ok(reply.task)
    }

    fn inform_task_status(&self, update: &TaskStatusUpdate) -> Result<()> {
        let ack: StatusAck = self.post("/v1/status", update)?;
        if ack.ok {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "control plane rejected status for task {}",
                update.task_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_base_url_is_trimmed() {
        let client = HttpControlPlane::new("https://cp.local:8443//");
        assert_eq!(client.base_url(), "https://cp.local:8443");
    }

    #[test]
    fn test_missing_pin_file() {
        let temp = TempDir::new().unwrap();
        let err = HttpControlPlane::with_pinned_cert("https://cp", &temp.path().join("cp.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_unreachable_server_is_retryable() {
        // Port 9 on loopback (discard) is closed in test sandboxes
        let client = HttpControlPlane::new("http://127.0.0.1:9");
        let err = client.get_task("client").unwrap_err();
        assert!(err.is_retryable());
    }
}
