//! Escalation rendezvous and LLM auto-approval.
//!
//! The mediator never owns a user interface. When a call escalates it
//! writes `request-<id>.json` into a shared directory and polls for
//! `response-<id>.json`, which any transport (CLI prompt, messaging bot)
//! may write. Before polling, an optional cheap-model auto-approver may
//! resolve low-risk escalations from captured user context.

pub mod auto_approve;
pub mod rendezvous;

pub use {
    auto_approve::{AutoApprover, AutoApproveVerdict},
    rendezvous::{EscalationDecision, EscalationRequest, Rendezvous},
};
