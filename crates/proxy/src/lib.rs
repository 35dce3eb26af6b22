//! The trusted MCP proxy: mediates every tool call between the agent and
//! the real tool servers through the policy engine, with escalation,
//! circuit breaking, and audit logging.

pub mod breaker;
pub mod mediator;

pub use {
    breaker::CircuitBreaker,
    mediator::{Mediator, MediatorConfig},
};
