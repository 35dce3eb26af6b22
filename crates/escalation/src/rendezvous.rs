//! File-based request/response rendezvous for one escalation.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    tracing::{debug, info, warn},
};

/// What the transport (or the timeout) decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationDecision {
    Approved,
    Denied,
}

/// The request file the mediator writes for the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub escalation_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub reason: String,
}

impl EscalationRequest {
    pub fn new(
        server_name: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
        reason: &str,
    ) -> Self {
        Self {
            escalation_id: uuid::Uuid::new_v4().to_string(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            arguments,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EscalationResponse {
    decision: EscalationDecision,
}

/// One shared directory, one pending escalation per request ID.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    dir: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl Rendezvous {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(500),
            timeout,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("request-{id}.json"))
    }

    fn response_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("response-{id}.json"))
    }

    /// Write the request file and poll for the response until the timeout.
    ///
    /// A timeout is a denial. Both files are unlinked on every exit path.
    pub async fn escalate(&self, request: &EscalationRequest) -> EscalationDecision {
        let id = &request.escalation_id;
        let request_path = self.request_path(id);
        let response_path = self.response_path(id);

        if let Err(e) = self.write_request(request, &request_path) {
            warn!(id, error = %e, "failed to write escalation request; denying");
            return EscalationDecision::Denied;
        }
        info!(
            id,
            server = %request.server_name,
            tool = %request.tool_name,
            "escalation pending human review"
        );

        let decision = self.poll_for_response(&response_path).await;

        cleanup(&request_path);
        cleanup(&response_path);
        decision
    }

    fn write_request(
        &self,
        request: &EscalationRequest,
        path: &Path,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, body)
    }

    async fn poll_for_response(&self, response_path: &Path) -> EscalationDecision {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Ok(raw) = std::fs::read_to_string(response_path) {
                match serde_json::from_str::<EscalationResponse>(&raw) {
                    Ok(response) => {
                        debug!(path = %response_path.display(), decision = ?response.decision,
                               "escalation response received");
                        return response.decision;
                    },
                    Err(e) => {
                        // Possibly a partial write; keep polling until the
                        // file parses or the window closes.
                        debug!(error = %e, "unparseable escalation response, retrying");
                    },
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(path = %response_path.display(), "escalation timed out; denying");
                return EscalationDecision::Denied;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Cancel a pending escalation (session close): write a synthetic
    /// denial so any in-flight poll resolves, then remove the files.
    pub fn cancel(&self, id: &str) {
        let response_path = self.response_path(id);
        let synthetic = serde_json::to_string(&EscalationResponse {
            decision: EscalationDecision::Denied,
        });
        if let Ok(body) = synthetic {
            let _ = std::fs::write(&response_path, body);
        }
        cleanup(&self.request_path(id));
    }
}

fn cleanup(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove rendezvous file");
    }
}
