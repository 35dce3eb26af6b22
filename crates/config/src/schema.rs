//! `config.json` schema.
//!
//! Every struct carries `#[serde(default)]` so missing fields are backfilled
//! from defaults. Credential-bearing fields are stripped before any write
//! (see `loader::save_config`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root user configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserConfig {
    pub models: ModelsConfig,
    /// LLM provider API keys, keyed by provider name (`anthropic`, ...).
    pub providers: HashMap<String, ProviderCredential>,
    pub budget: BudgetConfig,
    pub auto_approve: AutoApproveConfig,
    pub escalation: EscalationConfig,
    pub sandbox: SandboxConfig,
    /// Tool servers the mediator connects to.
    pub servers: HashMap<String, ToolServerConfig>,
    /// Per-server domain allowlists for the structural domain gate.
    pub domain_allowlists: HashMap<String, Vec<String>>,
    pub web_search: WebSearchConfig,
    pub signal: SignalConfig,
}

/// Model IDs per pipeline role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelsConfig {
    /// Model used to annotate tools and compile the constitution.
    pub compiler: String,
    /// Model used to judge verification mismatches.
    pub judge: String,
    /// Cheap model used by the escalation auto-approver.
    pub auto_approve: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            compiler: "claude-sonnet-4-5".into(),
            judge: "claude-sonnet-4-5".into(),
            auto_approve: "claude-haiku-4-5".into(),
        }
    }
}

/// A provider API credential. The key never round-trips to disk writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Resource budget caps for the compilation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Hard cap on LLM calls per pipeline run.
    pub max_llm_calls: u32,
    /// Verify/repair rounds before the pipeline gives up.
    pub max_repair_rounds: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: 50,
            max_repair_rounds: 3,
        }
    }
}

/// Escalation auto-approver settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoApproveConfig {
    pub enabled: bool,
}

/// Escalation rendezvous settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationConfig {
    /// Seconds to wait for a human decision. Clamped to 30–600 at load.
    pub timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl EscalationConfig {
    pub fn clamped_timeout_secs(&self) -> u64 {
        self.timeout_secs.clamp(30, 600)
    }
}

/// Sandbox enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Refuse to start when OS-level containment is unavailable.
    #[default]
    Enforce,
    /// Log a warning and proceed without containment.
    Warn,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    /// Override for the agent-writable directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Configuration for one real MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub enabled: bool,
    /// Wrap the launch command with OS-level containment.
    pub sandboxed: bool,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
            sandboxed: true,
        }
    }
}

/// Web search configuration for the fetch server (external collaborator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSearchConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Signal transport bot configuration (external collaborator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}
