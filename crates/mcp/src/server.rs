//! MCP stdio server loop: the face the mediator shows to the agent.
//!
//! Requests are handled strictly in arrival order; a slow tool call holds
//! up the session, which is exactly the per-session ordering the mediator
//! guarantees.

use {
    anyhow::Result,
    async_trait::async_trait,
    tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    tracing::{debug, info, warn},
};

use crate::types::{
    INVALID_PARAMS, InitializeResult, JsonRpcResponse, METHOD_NOT_FOUND, McpToolDef,
    PROTOCOL_VERSION, ServerCapabilities, ServerInfo, ToolsCallParams, ToolsCallResult,
    ToolsCapability, ToolsListResult,
};

/// What the embedding process plugs into the server loop.
#[async_trait]
pub trait McpServerHandler: Send + Sync {
    /// Aggregated tool list exposed to the agent.
    async fn list_tools(&self) -> Vec<McpToolDef>;

    /// Execute one tool call. Implementations return an error content block
    /// rather than failing the JSON-RPC request, so the agent always gets a
    /// structured result.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolsCallResult;
}

/// MCP server speaking JSON-RPC 2.0 over a pair of byte streams.
pub struct McpServer<H> {
    name: String,
    handler: H,
}

impl<H: McpServerHandler> McpServer<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve on this process's stdin/stdout until the client hangs up.
    pub async fn run_stdio(&self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve on arbitrary streams (tests use in-memory pipes).
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                info!(server = %self.name, "client closed the session");
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(message) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                warn!(server = %self.name, line = %trimmed, "client sent non-JSON line");
                continue;
            };

            let method = message.get("method").and_then(|m| m.as_str());
            let id = message.get("id").cloned();

            match (method, id) {
                (Some(method), Some(id)) if !id.is_null() => {
                    let params = message.get("params").cloned();
                    let response = self.handle_request(method, params, id).await;
                    let mut payload = serde_json::to_string(&response)?;
                    payload.push('\n');
                    writer.write_all(payload.as_bytes()).await?;
                    writer.flush().await?;
                },
                (Some(method), _) => {
                    debug!(server = %self.name, method = %method, "client notification");
                },
                _ => {
                    warn!(server = %self.name, "client sent message with no method");
                },
            }
        }
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        match method {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.into(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: false,
                        }),
                        resources: None,
                        prompts: None,
                    },
                    server_info: ServerInfo {
                        name: self.name.clone(),
                        version: Some(env!("CARGO_PKG_VERSION").into()),
                    },
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcResponse::result(id, value),
                    Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
                }
            },
            "tools/list" => {
                let tools = self.handler.list_tools().await;
                match serde_json::to_value(ToolsListResult { tools }) {
                    Ok(value) => JsonRpcResponse::result(id, value),
                    Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
                }
            },
            "tools/call" => {
                let parsed: std::result::Result<ToolsCallParams, String> = match params {
                    Some(p) => serde_json::from_value(p).map_err(|e| e.to_string()),
                    None => Err("missing params".into()),
                };
                match parsed {
                    Ok(call) => {
                        let result = self.handler.call_tool(&call.name, call.arguments).await;
                        match serde_json::to_value(result) {
                            Ok(value) => JsonRpcResponse::result(id, value),
                            Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
                        }
                    },
                    Err(e) => JsonRpcResponse::error(
                        id,
                        INVALID_PARAMS,
                        format!("invalid tools/call params: {e}"),
                    ),
                }
            },
            "ping" => JsonRpcResponse::result(id, serde_json::json!({})),
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("unsupported method: {other}"),
            ),
        }
    }
}
