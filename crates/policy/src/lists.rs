//! Dynamic lists: named value sets referenced from rules as `@list-name`.

use std::collections::HashMap;

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
};

use crate::rules::CompiledPolicy;

/// One named list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDefinition {
    pub entries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The persisted dynamic-lists artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicLists {
    pub generated_at: String,
    #[serde(default)]
    pub lists: HashMap<String, ListDefinition>,
}

impl DynamicLists {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dynamic lists: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid dynamic lists: {}", path.display()))
    }
}

/// Expand every `@list-name` reference in the policy's list conditions.
///
/// Referents come from the policy's own `listDefinitions` plus the dynamic
/// lists artifact (the artifact wins on collision). A missing referent fails
/// engine construction — a rule silently matching nothing would be a policy
/// hole.
pub fn expand_list_references(
    policy: &mut CompiledPolicy,
    dynamic: Option<&DynamicLists>,
) -> Result<()> {
    let mut definitions: HashMap<String, Vec<String>> =
        policy.list_definitions.clone().unwrap_or_default();
    if let Some(dynamic) = dynamic {
        for (name, def) in &dynamic.lists {
            definitions.insert(name.clone(), def.entries.clone());
        }
    }

    for rule in &mut policy.rules {
        let Some(lists) = &mut rule.condition.lists else {
            continue;
        };
        for list in lists {
            let mut expanded = Vec::with_capacity(list.allowed.len());
            for entry in &list.allowed {
                if let Some(name) = entry.strip_prefix('@') {
                    let referent = definitions.get(name).with_context(|| {
                        format!("rule '{}' references unknown list '@{name}'", rule.name)
                    })?;
                    expanded.extend(referent.iter().cloned());
                } else {
                    expanded.push(entry.clone());
                }
            }
            list.allowed = expanded;
        }
    }
    Ok(())
}
