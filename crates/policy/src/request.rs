//! Tool-call request records and policy decisions.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

/// An immutable record of one inbound tool call. Created by the proxy when
/// the call arrives; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRequest {
    pub fn new(server_name: &str, tool_name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            arguments,
            timestamp: Utc::now(),
        }
    }

    /// The same call with a different argument view (e.g. the policy view
    /// produced by the normalizer). The request identity is preserved.
    pub fn with_arguments(&self, arguments: Map<String, Value>) -> Self {
        Self {
            arguments,
            ..self.clone()
        }
    }
}

/// What the engine decided for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Escalate,
}

impl Decision {
    /// Restrictiveness ordering: deny > escalate > allow.
    pub fn severity(self) -> u8 {
        match self {
            Decision::Deny => 3,
            Decision::Escalate => 2,
            Decision::Allow => 1,
        }
    }

    /// The more restrictive of two decisions.
    pub fn max(self, other: Decision) -> Decision {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// A decision plus the rule (or structural invariant) that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub status: Decision,
    /// Identifier of the matching compiled rule or structural invariant.
    pub rule: String,
    pub reason: String,
}

impl PolicyDecision {
    pub fn new(status: Decision, rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status,
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}
