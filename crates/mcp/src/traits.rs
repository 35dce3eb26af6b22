//! Trait abstractions for MCP transport and client layers.
//!
//! These traits let the mediator and tests swap the underlying MCP
//! implementation without changing call sites.

use std::{path::PathBuf, time::Duration};

use {anyhow::Result, async_trait::async_trait, serde_json::Value};

use crate::{
    client::McpClientState,
    types::{JsonRpcResponse, McpToolDef, ToolsCallResult},
};

/// Transport layer for MCP communication (JSON-RPC).
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC request with an explicit timeout.
    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if the underlying connection/process is still alive.
    async fn is_alive(&self) -> bool;

    /// Kill/close the underlying connection/process.
    async fn kill(&self);
}

/// Client-level abstraction for an MCP server connection.
#[async_trait]
pub trait McpClientTrait: Send + Sync {
    /// The display name of the connected server.
    fn server_name(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> McpClientState;

    /// Cached tool definitions (call `list_tools` first to populate).
    fn tools(&self) -> &[McpToolDef];

    /// Fetch the list of tools from the server, caching the result.
    async fn list_tools(&mut self) -> Result<&[McpToolDef]>;

    /// Call a tool on the server.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult>;

    /// Current accessible roots advertised to the server.
    async fn roots(&self) -> Vec<PathBuf>;

    /// Add a root directory and notify the server that the list changed.
    async fn add_root(&self, dir: PathBuf) -> Result<()>;

    /// Check if the server process/connection is still alive.
    async fn is_alive(&self) -> bool;

    /// Shut down the server connection.
    async fn shutdown(&mut self);
}
