//! LLM access for the compilation pipeline and the escalation
//! auto-approver: a messages-API client, a stateful multi-turn session,
//! and the JSONL interaction log.

pub mod client;
pub mod logging;
pub mod session;

pub use {
    client::{ChatMessage, ChatResponse, LlmClient, Role, Usage},
    logging::InteractionLogger,
    session::ChatSession,
};
