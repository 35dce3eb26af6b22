//! Stage 1: connect to each configured tool server and list its tools.

use {
    anyhow::Result,
    ironcurtain_config::ToolServerConfig,
    ironcurtain_mcp::{McpClient, McpClientTrait},
    tracing::info,
};

/// One server's live tool schemas.
#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    pub name: String,
    /// `(tool name, input schema)` pairs, in server order.
    pub tools: Vec<(String, serde_json::Value)>,
}

/// Connect to every enabled server, enumerate its tools, and disconnect.
pub async fn discover_servers(
    servers: &[(String, ToolServerConfig)],
) -> Result<Vec<DiscoveredServer>> {
    let mut discovered = Vec::new();
    for (name, config) in servers {
        if !config.enabled {
            continue;
        }
        let mut client =
            McpClient::connect(name, &config.command, &config.args, &config.env, Vec::new())
                .await?;
        let tools = client
            .list_tools()
            .await?
            .iter()
            .map(|tool| (tool.name.clone(), tool.input_schema.clone()))
            .collect::<Vec<_>>();
        client.shutdown().await;

        info!(server = %name, tools = tools.len(), "discovered tools");
        discovered.push(DiscoveredServer {
            name: name.clone(),
            tools,
        });
    }
    Ok(discovered)
}
