//! MCP client: manages the protocol handshake, tool calls, and client-side
//! roots for a single MCP server.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    traits::{McpClientTrait, McpTransport},
    transport::{StdioTransport, TOOL_CALL_TIMEOUT},
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcResponse,
        McpToolDef, METHOD_NOT_FOUND, PROTOCOL_VERSION, Root, RootsCapability, RootsListResult,
        ToolsCallParams, ToolsCallResult, ToolsListResult,
    },
};

/// State of an MCP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Transport spawned, not yet initialized.
    Connected,
    /// `initialize` completed, `initialized` notification sent.
    Ready,
    /// Server process exited or was shut down.
    Closed,
}

/// An MCP client connected to a single server via stdio.
pub struct McpClient {
    server_name: String,
    transport: Arc<StdioTransport>,
    state: McpClientState,
    server_info: Option<InitializeResult>,
    tools: Vec<McpToolDef>,
    /// Directories advertised to the server via `roots/list`. Grows when
    /// an escalation is approved for a path outside the current roots.
    roots: Arc<RwLock<Vec<PathBuf>>>,
    roots_task: Option<tokio::task::JoinHandle<()>>,
}

impl McpClient {
    /// Spawn the server process, serve `roots/list`, and perform the MCP
    /// handshake (initialize + initialized).
    pub async fn connect(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        initial_roots: Vec<PathBuf>,
    ) -> Result<Self> {
        info!(server = %server_name, command = %command, args = ?args, "connecting to MCP server");
        let transport = StdioTransport::spawn(command, args, env).await?;

        let roots = Arc::new(RwLock::new(initial_roots));
        let roots_task = spawn_roots_responder(&transport, &roots, server_name).await;

        let mut client = Self {
            server_name: server_name.into(),
            transport,
            state: McpClientState::Connected,
            server_info: None,
            tools: Vec::new(),
            roots,
            roots_task,
        };

        if let Err(e) = client.initialize().await {
            warn!(server = %server_name, error = %e, "MCP initialize handshake failed");
            return Err(e);
        }

        Ok(client)
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities {
                roots: Some(RootsCapability { list_changed: true }),
                sampling: None,
            },
            client_info: ClientInfo {
                name: "ironcurtain".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let resp = self
            .transport
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await
            .context("MCP initialize request failed")?;

        let result: InitializeResult =
            serde_json::from_value(resp.result.context("MCP initialize returned no result")?)
                .context("failed to parse MCP initialize result")?;

        info!(
            server = %self.server_name,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        self.server_info = Some(result);

        // Send `initialized` notification to complete handshake.
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        self.state = McpClientState::Ready;

        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != McpClientState::Ready {
            anyhow::bail!(
                "MCP client for '{}' is not ready (state: {:?})",
                self.server_name,
                self.state
            );
        }
        Ok(())
    }
}

/// Serve server-initiated requests: `roots/list` from the shared root set,
/// method-not-found for anything else.
async fn spawn_roots_responder(
    transport: &Arc<StdioTransport>,
    roots: &Arc<RwLock<Vec<PathBuf>>>,
    server_name: &str,
) -> Option<tokio::task::JoinHandle<()>> {
    let mut incoming = transport.take_incoming().await?;
    let transport = Arc::clone(transport);
    let roots = Arc::clone(roots);
    let server = server_name.to_string();

    Some(tokio::spawn(async move {
        while let Some(req) = incoming.recv().await {
            let response = if req.method == "roots/list" {
                let listed: Vec<Root> = roots
                    .read()
                    .await
                    .iter()
                    .map(|dir| Root {
                        uri: format!("file://{}", dir.display()),
                        name: None,
                    })
                    .collect();
                debug!(server = %server, roots = listed.len(), "serving roots/list");
                match serde_json::to_value(RootsListResult { roots: listed }) {
                    Ok(value) => JsonRpcResponse::result(req.id, value),
                    Err(e) => JsonRpcResponse::error(req.id, METHOD_NOT_FOUND, e.to_string()),
                }
            } else {
                JsonRpcResponse::error(
                    req.id,
                    METHOD_NOT_FOUND,
                    format!("unsupported server request: {}", req.method),
                )
            };
            if let Err(e) = transport.respond(&response).await {
                warn!(server = %server, error = %e, "failed to answer server request");
                break;
            }
        }
    }))
}

#[async_trait::async_trait]
impl McpClientTrait for McpClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn state(&self) -> McpClientState {
        self.state
    }

    fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    async fn list_tools(&mut self) -> Result<&[McpToolDef]> {
        self.ensure_ready()?;

        let resp = self.transport.request("tools/list", None).await?;
        let result: ToolsListResult =
            serde_json::from_value(resp.result.context("tools/list returned no result")?)?;

        debug!(
            server = %self.server_name,
            count = result.tools.len(),
            "fetched MCP tools"
        );

        self.tools = result.tools;
        Ok(&self.tools)
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolsCallResult> {
        self.ensure_ready()?;

        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };

        let resp = self
            .transport
            .request_with_timeout(
                "tools/call",
                Some(serde_json::to_value(&params)?),
                TOOL_CALL_TIMEOUT,
            )
            .await?;

        Ok(serde_json::from_value(
            resp.result.context("tools/call returned no result")?,
        )?)
    }

    async fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().await.clone()
    }

    async fn add_root(&self, dir: PathBuf) -> Result<()> {
        {
            let mut roots = self.roots.write().await;
            if roots.contains(&dir) {
                return Ok(());
            }
            info!(server = %self.server_name, root = %dir.display(), "expanding accessible roots");
            roots.push(dir);
        }
        self.transport
            .notify("notifications/roots/list_changed", None)
            .await
    }

    async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    async fn shutdown(&mut self) {
        self.state = McpClientState::Closed;
        if let Some(task) = self.roots_task.take() {
            task.abort();
        }
        self.transport.kill().await;
    }
}
