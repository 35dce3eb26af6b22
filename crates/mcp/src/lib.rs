//! MCP (Model Context Protocol) plumbing for the trusted mediator.
//!
//! This crate provides:
//! - JSON-RPC 2.0 over stdio transport (`transport`)
//! - MCP client with handshake, tool calls, and client-side roots (`client`)
//! - MCP stdio server loop so the mediator can face the agent (`server`)
//! - Protocol types (`types`)

pub mod client;
pub mod server;
pub mod traits;
pub mod transport;
pub mod types;

pub use {
    client::{McpClient, McpClientState},
    server::{McpServer, McpServerHandler},
    traits::{McpClientTrait, McpTransport},
    transport::StdioTransport,
};
