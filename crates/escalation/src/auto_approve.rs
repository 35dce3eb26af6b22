//! LLM auto-approval of low-risk escalations.
//!
//! The judge reads the captured user context and decides whether the
//! escalated call is within the spirit of what the user asked for. It may
//! only upgrade escalate to allow; anything else falls through to the
//! human rendezvous.

use std::path::PathBuf;

use {
    anyhow::Result,
    ironcurtain_llm::{ChatMessage, LlmClient},
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::rendezvous::EscalationRequest;

const SYSTEM_PROMPT: &str = "\
You review tool calls that a security policy escalated for human approval. \
You are given the user's recent task instruction and one escalated call. \
Approve the call only when it is clearly within the spirit of what the user \
asked for; when in doubt, do not approve — a human will decide. \
Reply with JSON only: {\"approve\": boolean, \"reasoning\": string}.";

/// Captured user context written by the session transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<String>,
}

/// A positive auto-approval, with the judge's reasoning for the audit log.
#[derive(Debug, Clone)]
pub struct AutoApproveVerdict {
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    approve: bool,
    #[serde(default)]
    reasoning: String,
}

pub struct AutoApprover {
    client: LlmClient,
    context_path: PathBuf,
}

impl AutoApprover {
    pub fn new(client: LlmClient, context_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            context_path: context_path.into(),
        }
    }

    /// Judge one escalation. `Some` means upgrade to allow; `None` means
    /// hand the request to the human transport.
    pub async fn judge(&self, request: &EscalationRequest) -> Option<AutoApproveVerdict> {
        let context = match self.read_context() {
            Ok(Some(context)) => context,
            Ok(None) => {
                debug!("no user context captured; skipping auto-approval");
                return None;
            },
            Err(e) => {
                warn!(error = %e, "failed to read user context; skipping auto-approval");
                return None;
            },
        };

        let prompt = format!(
            "User instruction:\n{}\n\nEscalated call:\n  server: {}\n  tool: {}\n  \
             arguments: {}\n  escalation reason: {}",
            context.instruction,
            request.server_name,
            request.tool_name,
            serde_json::Value::Object(request.arguments.clone()),
            request.reason,
        );

        let response = match self
            .client
            .complete("auto-approve", SYSTEM_PROMPT, &[ChatMessage::user(prompt)])
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "auto-approve model call failed; deferring to human");
                return None;
            },
        };

        match parse_reply(&response.text) {
            Some(reply) if reply.approve => {
                info!(
                    id = %request.escalation_id,
                    reasoning = %reply.reasoning,
                    "escalation auto-approved"
                );
                Some(AutoApproveVerdict {
                    reasoning: reply.reasoning,
                })
            },
            Some(reply) => {
                debug!(reasoning = %reply.reasoning, "auto-approver declined; deferring to human");
                None
            },
            None => {
                warn!(text = %response.text, "unparseable auto-approve reply; deferring to human");
                None
            },
        }
    }

    fn read_context(&self) -> Result<Option<UserContext>> {
        if !self.context_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.context_path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

/// Accept plain JSON or a fenced code block around it.
fn parse_reply(text: &str) -> Option<JudgeReply> {
    let trimmed = text.trim();
    if let Ok(reply) = serde_json::from_str(trimmed) {
        return Some(reply);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}
