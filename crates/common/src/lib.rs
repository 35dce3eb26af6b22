//! Shared utilities used across the ironcurtain crates.

pub mod jsonl;

pub use jsonl::JsonlWriter;
