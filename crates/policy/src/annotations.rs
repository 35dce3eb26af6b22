//! Tool annotations: the per-tool argument-role map produced by the
//! annotator stage and consumed by the normalizer and the engine.

use std::collections::HashMap;

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::roles::ArgumentRole;

/// Role assignment for one tool. An argument may carry several roles
/// (a move's source is both read-path and delete-path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotation {
    pub tool_name: String,
    pub server_name: String,
    /// The annotator's one-line summary of what the tool does.
    pub comment: String,
    pub side_effects: bool,
    /// Ordered role list per argument name.
    pub args: HashMap<String, Vec<ArgumentRole>>,
}

impl ToolAnnotation {
    /// Distinct non-`none` roles across all arguments, in registry order.
    pub fn distinct_roles(&self) -> Vec<ArgumentRole> {
        let mut roles: Vec<ArgumentRole> = self
            .args
            .values()
            .flatten()
            .copied()
            .filter(|r| *r != ArgumentRole::None)
            .collect();
        roles.sort();
        roles.dedup();
        roles
    }

    /// Argument names carrying any of `roles`.
    pub fn args_with_roles(&self, roles: &[ArgumentRole]) -> Vec<&str> {
        self.args
            .iter()
            .filter(|(_, assigned)| assigned.iter().any(|r| roles.contains(r)))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Annotations for one server, cache-keyed by the hash of its tool schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnnotations {
    pub input_hash: String,
    pub tools: Vec<ToolAnnotation>,
}

/// The persisted tool-annotations artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotationsFile {
    pub generated_at: String,
    pub servers: HashMap<String, ServerAnnotations>,
}

impl ToolAnnotationsFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tool annotations: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid tool annotations: {}", path.display()))
    }

    pub fn lookup(&self, server: &str, tool: &str) -> Option<&ToolAnnotation> {
        self.servers
            .get(server)?
            .tools
            .iter()
            .find(|t| t.tool_name == tool)
    }

    /// Cross-check annotations against the live tool schemas for `server`.
    ///
    /// Every live tool must be annotated, every annotated tool must still
    /// exist, and the annotated argument set must exactly cover the schema's
    /// properties. Any drift invalidates the artifact and points the
    /// operator at `compile-policy`.
    pub fn validate_against_schemas(
        &self,
        server: &str,
        tools: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let annotations = self
            .servers
            .get(server)
            .with_context(|| format!("no annotations for server '{server}'; run compile-policy"))?;

        for (tool_name, schema) in tools {
            let annotation = annotations
                .tools
                .iter()
                .find(|t| &t.tool_name == tool_name)
                .with_context(|| {
                    format!("tool '{server}/{tool_name}' is not annotated; run compile-policy")
                })?;

            let schema_args: Vec<&str> = schema
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|p| p.keys().map(String::as_str).collect())
                .unwrap_or_default();

            for arg in &schema_args {
                if !annotation.args.contains_key(*arg) {
                    anyhow::bail!(
                        "tool '{server}/{tool_name}' argument '{arg}' has no role annotation; \
                         run compile-policy"
                    );
                }
            }
            for arg in annotation.args.keys() {
                if !schema_args.contains(&arg.as_str()) {
                    anyhow::bail!(
                        "annotation for '{server}/{tool_name}' covers unknown argument '{arg}'; \
                         run compile-policy"
                    );
                }
            }
        }

        for annotation in &annotations.tools {
            if !tools.iter().any(|(name, _)| name == &annotation.tool_name) {
                anyhow::bail!(
                    "annotation for '{server}/{}' has no live tool; run compile-policy",
                    annotation.tool_name
                );
            }
        }

        debug!(server, tools = tools.len(), "annotations match live schemas");
        Ok(())
    }
}
