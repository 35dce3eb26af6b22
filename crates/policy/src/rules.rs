//! Compiled rules: the declarative, auditable JSON records the engine
//! evaluates. Rules are data, not closures — the whole point of the
//! compilation pipeline is that the engine is fully driven by JSON the user
//! can read.

use {
    anyhow::{Context as _, Result},
    serde::{Deserialize, Serialize},
    tracing::warn,
};

use crate::{request::Decision, roles::ArgumentRole};

/// Rule names reserved for hardcoded Phase-1 invariants. Compiled rules may
/// not reimplement these concerns.
pub const STRUCTURAL_RULES: &[&str] = &[
    "structural-protected-path",
    "structural-sandbox-allow",
    "structural-unknown-tool",
    "structural-domain-escalate",
];

/// Match-type for a dynamic-list condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMatchType {
    Domains,
    Emails,
    Identifiers,
}

/// `paths` predicate: every path extracted from arguments with `roles` must
/// resolve within `within`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsCondition {
    pub roles: Vec<ArgumentRole>,
    pub within: String,
}

/// `domains` predicate: every domain extracted from arguments with `roles`
/// must match the allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainsCondition {
    pub roles: Vec<ArgumentRole>,
    pub allowed: Vec<String>,
}

/// One entry of the `lists` predicate. `allowed` may contain symbolic
/// `@list-name` references expanded at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCondition {
    pub roles: Vec<ArgumentRole>,
    pub allowed: Vec<String>,
    pub match_type: ListMatchType,
}

/// Conjunction of optional predicates. A rule matches when every present
/// predicate is satisfied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<ArgumentRole>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainsCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lists: Option<Vec<ListCondition>>,
}

impl Condition {
    /// Roles this condition is scoped to, across all role-bearing predicates.
    /// Empty means the condition is role-agnostic.
    pub fn referenced_roles(&self) -> Vec<ArgumentRole> {
        let mut roles = Vec::new();
        if let Some(r) = &self.roles {
            roles.extend(r.iter().copied());
        }
        if let Some(p) = &self.paths {
            roles.extend(p.roles.iter().copied());
        }
        if let Some(d) = &self.domains {
            roles.extend(d.roles.iter().copied());
        }
        if let Some(lists) = &self.lists {
            for l in lists {
                roles.extend(l.roles.iter().copied());
            }
        }
        roles.sort();
        roles.dedup();
        roles
    }
}

/// One compiled rule. Order within the rule chain is significant:
/// first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub name: String,
    pub description: String,
    /// Reference into the constitution this rule implements.
    pub principle: String,
    #[serde(rename = "if")]
    pub condition: Condition,
    pub then: Decision,
    pub reason: String,
}

/// The persisted compiled-policy artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPolicy {
    pub generated_at: String,
    pub constitution_hash: String,
    pub input_hash: String,
    pub rules: Vec<CompiledRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_definitions: Option<std::collections::HashMap<String, Vec<String>>>,
}

impl CompiledPolicy {
    /// Load the artifact, normalizing legacy rule names.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read compiled policy: {}", path.display()))?;
        let mut policy: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid compiled policy: {}", path.display()))?;
        policy.normalize_legacy_names();
        Ok(policy)
    }

    /// Older artifacts call the no-match fallback `default-deny`. The
    /// contract is `default-escalate`: absence of a matching rule surfaces
    /// to a human instead of refusing silently.
    pub fn normalize_legacy_names(&mut self) {
        for rule in &mut self.rules {
            if rule.name == "default-deny" {
                warn!(rule = %rule.name, "normalizing legacy rule name to default-escalate");
                rule.name = "default-escalate".into();
                rule.then = Decision::Escalate;
            }
        }
    }

    /// Static validation, run after compilation and again on load.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            validate_rule(rule)?;
        }
        Ok(())
    }
}

fn validate_rule(rule: &CompiledRule) -> Result<()> {
    // Structural invariants are hardcoded, not compiled. A rule that tries
    // to restate them would silently shadow (or contradict) Phase 1.
    if rule.name.starts_with("structural-") || STRUCTURAL_RULES.contains(&rule.name.as_str()) {
        anyhow::bail!(
            "rule '{}' names a structural invariant; protected paths and unknown tools \
             are enforced in code, not rules",
            rule.name
        );
    }
    for needle in ["protected path", "unknown tool"] {
        if rule.description.to_ascii_lowercase().contains(needle) {
            anyhow::bail!(
                "rule '{}' re-implements a structural invariant ({needle}); remove it",
                rule.name
            );
        }
    }

    if let Some(roles) = &rule.condition.roles
        && roles.is_empty()
    {
        anyhow::bail!("rule '{}' has an empty roles condition", rule.name);
    }

    if let Some(paths) = &rule.condition.paths {
        if paths.roles.is_empty() {
            anyhow::bail!("rule '{}' has a paths condition with no roles", rule.name);
        }
        if !paths.within.starts_with('/') {
            anyhow::bail!(
                "rule '{}': paths.within must be absolute, got '{}'",
                rule.name,
                paths.within
            );
        }
    }

    if let Some(domains) = &rule.condition.domains
        && domains.roles.is_empty()
    {
        anyhow::bail!("rule '{}' has a domains condition with no roles", rule.name);
    }

    if let Some(lists) = &rule.condition.lists {
        for list in lists {
            if list.roles.is_empty() {
                anyhow::bail!("rule '{}' has a lists condition with no roles", rule.name);
            }
        }
    }

    Ok(())
}
