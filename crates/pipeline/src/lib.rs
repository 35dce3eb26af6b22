//! The offline compilation pipeline: Discover → Annotate → Compile →
//! Scenario-Generate → Verify, with content-hash caching and multi-turn
//! LLM repair.
//!
//! Every stage writes its artifact under `generated/` stamped with the
//! hash of its inputs; re-running with identical inputs is a no-op.

pub mod annotate;
pub mod artifacts;
pub mod compile;
pub mod discover;
pub mod run;
pub mod scenarios;
pub mod verify;

pub use {
    discover::DiscoveredServer,
    run::{PipelineConfig, PipelineOutcome, run_pipeline},
};
