//! User configuration and the per-user home directory layout.
//!
//! Everything ironcurtain persists lives under a single home directory
//! (default `~/.ironcurtain/`, overridable via `IRONCURTAIN_HOME`):
//! `config.json`, the user constitution overlay, compiled artifacts under
//! `generated/`, the MITM CA under `ca/`, the agent sandbox, and the audit
//! log.

pub mod loader;
pub mod paths;
pub mod schema;

pub use {
    loader::{load_config, save_config},
    paths::Home,
    schema::{
        AutoApproveConfig, EscalationConfig, ModelsConfig, ProviderCredential, SandboxMode,
        ToolServerConfig, UserConfig,
    },
};
