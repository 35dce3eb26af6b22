//! Append-only audit log of every mediated tool call.
//!
//! Writes are best-effort: a failing disk never blocks a tool call. Entries
//! record the transport-view arguments — what the tool server actually
//! received — not the policy view.

use std::path::Path;

use {
    chrono::{DateTime, Utc},
    ironcurtain_common::JsonlWriter,
    ironcurtain_policy::PolicyDecision,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

/// How the escalation (if any) was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationResult {
    Approved,
    Denied,
}

/// Final outcome of the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Denied,
    Error,
}

impl CallResult {
    pub fn success() -> Self {
        Self {
            status: CallStatus::Success,
            error: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            status: CallStatus::Denied,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// One audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    /// Transport-view arguments.
    pub arguments: Map<String, Value>,
    pub policy_decision: PolicyDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_result: Option<EscalationResult>,
    pub result: CallResult,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandboxed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
}

/// The append-only audit log.
pub struct AuditLog {
    writer: JsonlWriter,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            writer: JsonlWriter::new(path.as_ref()),
        }
    }

    /// Append an entry. Failures are logged and swallowed.
    pub fn record(&self, entry: &AuditEntry) {
        self.writer.append_best_effort(entry);
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}
