//! The two-phase policy engine.
//!
//! Phase 1 applies hardcoded structural invariants that no compiled rule
//! can override: protected paths, sandbox containment for the filesystem
//! server, unknown tools, and the per-server domain gate. Phase 2 evaluates
//! the compiled rule chain once per argument role and combines the results
//! by severity.
//!
//! The engine is immutable after construction and safe to share.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use {anyhow::Result, serde_json::Value, tracing::debug};

use crate::{
    FILESYSTEM_SERVER,
    annotations::{ToolAnnotation, ToolAnnotationsFile},
    lists::{DynamicLists, expand_list_references},
    normalize::{
        canonicalize_lenient, domain_allowed, domain_matches, extract_domain, is_within,
        resolve_policy_path,
    },
    request::{Decision, PolicyDecision, ToolCallRequest},
    roles::{ArgumentRole, RoleCategory},
    rules::{CompiledPolicy, CompiledRule, Condition, ListMatchType},
};

/// Everything the engine needs, gathered once at session start.
pub struct EngineConfig {
    pub policy: CompiledPolicy,
    pub annotations: ToolAnnotationsFile,
    pub protected_paths: Vec<PathBuf>,
    pub sandbox_dir: Option<PathBuf>,
    /// Per-server domain allowlists for the structural domain gate.
    pub domain_allowlists: HashMap<String, Vec<String>>,
    pub dynamic_lists: Option<DynamicLists>,
}

pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    annotations: ToolAnnotationsFile,
    protected_paths: Vec<PathBuf>,
    sandbox_dir: Option<PathBuf>,
    domain_allowlists: HashMap<String, Vec<String>>,
}

/// One path pulled out of a request, with the roles of the argument that
/// carried it.
struct ExtractedPath {
    arg: String,
    raw: String,
    resolved: PathBuf,
    roles: Vec<ArgumentRole>,
}

impl PolicyEngine {
    /// Construct the engine. Validates the rule set and expands every
    /// `@list-name` reference; a missing referent fails fast.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let mut policy = config.policy;
        policy.normalize_legacy_names();
        policy.validate()?;
        expand_list_references(&mut policy, config.dynamic_lists.as_ref())?;

        Ok(Self {
            rules: policy.rules,
            annotations: config.annotations,
            protected_paths: config
                .protected_paths
                .iter()
                .map(|p| canonicalize_lenient(p))
                .collect(),
            sandbox_dir: config.sandbox_dir.map(|d| canonicalize_lenient(&d)),
            domain_allowlists: config.domain_allowlists,
        })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Evaluate one call. `request.arguments` must be the policy view
    /// produced by the normalizer.
    pub fn evaluate(&self, request: &ToolCallRequest) -> PolicyDecision {
        let annotation = self
            .annotations
            .lookup(&request.server_name, &request.tool_name);

        let paths = self.collect_paths(request, annotation);

        // Protected paths trump everything, sandbox containment included.
        for path in &paths {
            for protected in &self.protected_paths {
                if is_within(&path.resolved, protected) {
                    return PolicyDecision::new(
                        Decision::Deny,
                        "structural-protected-path",
                        format!(
                            "'{}' is within the protected path '{}'",
                            path.resolved.display(),
                            protected.display()
                        ),
                    );
                }
            }
        }

        // Sandbox containment shortcut, filesystem server only. Other
        // servers always see the full rule chain.
        let discharged = self.discharged_values(request, annotation, &paths);
        if request.server_name == FILESYSTEM_SERVER
            && let Some(sandbox) = &self.sandbox_dir
        {
            let candidates: Vec<&ExtractedPath> = paths
                .iter()
                .filter(|p| p.roles.iter().any(|r| r.is_sandbox_safe()))
                .collect();
            if !candidates.is_empty()
                && candidates.iter().all(|p| is_within(&p.resolved, sandbox))
            {
                return PolicyDecision::new(
                    Decision::Allow,
                    "structural-sandbox-allow",
                    format!("all paths are within the sandbox '{}'", sandbox.display()),
                );
            }
        }

        let Some(annotation) = annotation else {
            return PolicyDecision::new(
                Decision::Deny,
                "structural-unknown-tool",
                format!(
                    "no annotation for '{}/{}'; run compile-policy",
                    request.server_name, request.tool_name
                ),
            );
        };

        // Domain gate: a URL argument resolving to a domain outside the
        // server's allowlist escalates. Matching domains are neither
        // auto-allowed nor denied; they continue to Phase 2.
        if let Some(allowlist) = self.domain_allowlists.get(&request.server_name) {
            for (arg, roles) in &annotation.args {
                if !roles.iter().any(|r| r.category() == RoleCategory::Url) {
                    continue;
                }
                for value in string_values(request.arguments.get(arg)) {
                    if let Some(domain) = extract_domain(value)
                        && !domain_allowed(&domain, allowlist)
                    {
                        return PolicyDecision::new(
                            Decision::Escalate,
                            "structural-domain-escalate",
                            format!(
                                "domain '{domain}' is not on the allowlist for server '{}'",
                                request.server_name
                            ),
                        );
                    }
                }
            }
        }

        self.evaluate_rules(request, annotation, &discharged)
    }

    // ── Phase 2 ─────────────────────────────────────────────────────────

    fn evaluate_rules(
        &self,
        request: &ToolCallRequest,
        annotation: &ToolAnnotation,
        discharged: &HashSet<(String, String)>,
    ) -> PolicyDecision {
        let roles = annotation.distinct_roles();

        if roles.is_empty() {
            return self.evaluate_chain(request, annotation, None, discharged);
        }

        // Skip roles whose every extracted value was discharged by sandbox
        // containment; the remaining roles see the normal rules. This is
        // what gives partial calls (move_file with one side outside the
        // sandbox) their fine-grained outcome.
        let active: Vec<ArgumentRole> = roles
            .into_iter()
            .filter(|role| !self.role_fully_discharged(request, annotation, *role, discharged))
            .collect();

        let mut combined: Option<PolicyDecision> = None;
        for role in active {
            let decision = self.evaluate_chain(request, annotation, Some(role), discharged);
            debug!(
                role = role.wire_name(),
                status = ?decision.status,
                rule = %decision.rule,
                "per-role decision"
            );
            let more_severe = match &combined {
                Some(current) => decision.status.severity() > current.status.severity(),
                None => true,
            };
            if more_severe {
                let is_deny = decision.status == Decision::Deny;
                combined = Some(decision);
                if is_deny {
                    break;
                }
            }
        }

        combined.unwrap_or_else(|| {
            PolicyDecision::new(
                Decision::Escalate,
                "default-escalate",
                "no compiled rule matched; surfacing to a human",
            )
        })
    }

    fn role_fully_discharged(
        &self,
        request: &ToolCallRequest,
        annotation: &ToolAnnotation,
        role: ArgumentRole,
        discharged: &HashSet<(String, String)>,
    ) -> bool {
        if !role.is_sandbox_safe() {
            return false;
        }
        let mut any = false;
        for (arg, roles) in &annotation.args {
            if !roles.contains(&role) {
                continue;
            }
            for value in string_values(request.arguments.get(arg)) {
                any = true;
                if !discharged.contains(&(arg.clone(), value.to_string())) {
                    return false;
                }
            }
        }
        any
    }

    fn evaluate_chain(
        &self,
        request: &ToolCallRequest,
        annotation: &ToolAnnotation,
        current_role: Option<ArgumentRole>,
        discharged: &HashSet<(String, String)>,
    ) -> PolicyDecision {
        for rule in &self.rules {
            if let Some(role) = current_role {
                let referenced = rule.condition.referenced_roles();
                if !referenced.is_empty() && !referenced.contains(&role) {
                    continue;
                }
            }
            if self.condition_matches(&rule.condition, request, annotation, discharged) {
                return PolicyDecision::new(rule.then, rule.name.clone(), rule.reason.clone());
            }
        }
        PolicyDecision::new(
            Decision::Escalate,
            "default-escalate",
            "no compiled rule matched; surfacing to a human",
        )
    }

    fn condition_matches(
        &self,
        condition: &Condition,
        request: &ToolCallRequest,
        annotation: &ToolAnnotation,
        discharged: &HashSet<(String, String)>,
    ) -> bool {
        if let Some(servers) = &condition.server
            && !servers.contains(&request.server_name)
        {
            return false;
        }
        if let Some(tools) = &condition.tool
            && !tools.contains(&request.tool_name)
        {
            return false;
        }
        if let Some(side_effects) = condition.side_effects
            && annotation.side_effects != side_effects
        {
            return false;
        }
        if let Some(roles) = &condition.roles {
            let present = annotation
                .args
                .values()
                .flatten()
                .any(|r| roles.contains(r));
            if !present {
                return false;
            }
        }
        if let Some(paths) = &condition.paths {
            let extracted = self.extract_role_values(request, annotation, &paths.roles, discharged);
            // Zero extraction is no match: the call falls through to a
            // later or default rule instead of being silently permitted.
            if extracted.is_empty() {
                return false;
            }
            let within = canonicalize_lenient(Path::new(&paths.within));
            if !extracted.iter().all(|raw| {
                is_within(
                    &resolve_policy_path(raw, self.sandbox_dir.as_deref()),
                    &within,
                )
            }) {
                return false;
            }
        }
        if let Some(domains) = &condition.domains {
            let extracted =
                self.extract_role_values(request, annotation, &domains.roles, discharged);
            if extracted.is_empty() {
                return false;
            }
            // Every value must resolve to a domain and match; an opaque
            // value (unresolved named remote) fails the whole predicate.
            if !extracted.iter().all(|raw| {
                extract_domain(raw).is_some_and(|d| domain_allowed(&d, &domains.allowed))
            }) {
                return false;
            }
        }
        if let Some(lists) = &condition.lists {
            for list in lists {
                let extracted =
                    self.extract_role_values(request, annotation, &list.roles, discharged);
                if extracted.is_empty() {
                    return false;
                }
                let all_match = extracted.iter().all(|raw| match list.match_type {
                    ListMatchType::Domains => extract_domain(raw)
                        .is_some_and(|d| list.allowed.iter().any(|p| domain_matches(&d, p))),
                    ListMatchType::Emails => list
                        .allowed
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(raw)),
                    ListMatchType::Identifiers => list.allowed.iter().any(|a| a == raw),
                });
                if !all_match {
                    return false;
                }
            }
        }
        true
    }

    /// String values from arguments carrying any of `roles`, minus values
    /// already discharged by sandbox containment. Array arguments
    /// contribute each element independently.
    fn extract_role_values(
        &self,
        request: &ToolCallRequest,
        annotation: &ToolAnnotation,
        roles: &[ArgumentRole],
        discharged: &HashSet<(String, String)>,
    ) -> Vec<String> {
        let mut values = Vec::new();
        for (arg, assigned) in &annotation.args {
            if !assigned.iter().any(|r| roles.contains(r)) {
                continue;
            }
            for value in string_values(request.arguments.get(arg)) {
                if discharged.contains(&(arg.clone(), value.to_string())) {
                    continue;
                }
                values.push(value.to_string());
            }
        }
        values
    }

    // ── Phase 1 helpers ─────────────────────────────────────────────────

    /// Collect path-like values using both annotation-driven extraction and
    /// the `/` `.` `~` prefix heuristic. The union is deliberate
    /// defense-in-depth: an unannotated path-shaped argument still hits the
    /// protected-path check.
    fn collect_paths(
        &self,
        request: &ToolCallRequest,
        annotation: Option<&ToolAnnotation>,
    ) -> Vec<ExtractedPath> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut paths = Vec::new();

        for (arg, value) in &request.arguments {
            let roles: Vec<ArgumentRole> = annotation
                .and_then(|a| a.args.get(arg))
                .cloned()
                .unwrap_or_default();
            let role_is_path = roles.iter().any(|r| r.category() == RoleCategory::Path);

            for raw in string_values(Some(value)) {
                let heuristic_hit =
                    raw.starts_with('/') || raw.starts_with('.') || raw.starts_with('~');
                if !role_is_path && !heuristic_hit {
                    continue;
                }
                if !seen.insert((arg.clone(), raw.to_string())) {
                    continue;
                }
                paths.push(ExtractedPath {
                    arg: arg.clone(),
                    raw: raw.to_string(),
                    resolved: resolve_policy_path(raw, self.sandbox_dir.as_deref()),
                    roles: roles.clone(),
                });
            }
        }
        paths
    }

    /// Values the sandbox-containment check already vouched for: inside the
    /// sandbox, on the filesystem server, carried by a sandbox-safe role.
    fn discharged_values(
        &self,
        request: &ToolCallRequest,
        annotation: Option<&ToolAnnotation>,
        paths: &[ExtractedPath],
    ) -> HashSet<(String, String)> {
        let mut discharged = HashSet::new();
        if request.server_name != FILESYSTEM_SERVER || annotation.is_none() {
            return discharged;
        }
        let Some(sandbox) = &self.sandbox_dir else {
            return discharged;
        };
        for path in paths {
            if path.roles.iter().any(|r| r.is_sandbox_safe())
                && is_within(&path.resolved, sandbox)
            {
                discharged.insert((path.arg.clone(), path.raw.clone()));
            }
        }
        discharged
    }
}

/// A string value, or each string element of an array. Anything else is
/// treated as absent rather than an error.
fn string_values(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            annotations::ServerAnnotations,
            rules::{DomainsCondition, PathsCondition},
        },
        serde_json::json,
        std::collections::HashMap,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        sandbox: PathBuf,
        protected: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let sandbox = base.join("sandbox");
        std::fs::create_dir(&sandbox).unwrap();
        std::fs::write(sandbox.join("a.txt"), "x").unwrap();
        let protected = base.join("audit.jsonl");
        std::fs::write(&protected, "").unwrap();
        Fixture {
            _dir: dir,
            sandbox,
            protected,
        }
    }

    fn annotation(
        server: &str,
        tool: &str,
        side_effects: bool,
        args: &[(&str, &[ArgumentRole])],
    ) -> ToolAnnotation {
        ToolAnnotation {
            tool_name: tool.into(),
            server_name: server.into(),
            comment: String::new(),
            side_effects,
            args: args
                .iter()
                .map(|(name, roles)| (name.to_string(), roles.to_vec()))
                .collect(),
        }
    }

    fn annotations_file(tools: Vec<ToolAnnotation>) -> ToolAnnotationsFile {
        let mut servers: HashMap<String, ServerAnnotations> = HashMap::new();
        for tool in tools {
            servers
                .entry(tool.server_name.clone())
                .or_insert_with(|| ServerAnnotations {
                    input_hash: "h".into(),
                    tools: Vec::new(),
                })
                .tools
                .push(tool);
        }
        ToolAnnotationsFile {
            generated_at: "t".into(),
            servers,
        }
    }

    fn rule(
        name: &str,
        condition: Condition,
        then: Decision,
    ) -> CompiledRule {
        CompiledRule {
            name: name.into(),
            description: format!("{name} rule"),
            principle: "P".into(),
            condition,
            then,
            reason: format!("{name} matched"),
        }
    }

    /// The standard rule chain used across scenario tests, mirroring what
    /// the compiler produces for the default constitution. The
    /// side-effect-free rule sits last: read_file is itself side-effect
    /// free, so an earlier position would shadow the per-role read rules.
    fn standard_rules(sandbox: &Path) -> Vec<CompiledRule> {
        let within = sandbox.display().to_string();
        vec![
            rule(
                "escalate-git-destructive-ops",
                Condition {
                    roles: Some(vec![ArgumentRole::WriteHistory, ArgumentRole::DeleteHistory]),
                    ..Default::default()
                },
                Decision::Escalate,
            ),
            rule(
                "allow-read-within-sandbox",
                Condition {
                    paths: Some(PathsCondition {
                        roles: vec![ArgumentRole::ReadPath],
                        within: within.clone(),
                    }),
                    ..Default::default()
                },
                Decision::Allow,
            ),
            rule(
                "escalate-read-outside-sandbox",
                Condition {
                    roles: Some(vec![ArgumentRole::ReadPath]),
                    ..Default::default()
                },
                Decision::Escalate,
            ),
            rule(
                "allow-write-within-sandbox",
                Condition {
                    paths: Some(PathsCondition {
                        roles: vec![ArgumentRole::WritePath],
                        within: within.clone(),
                    }),
                    ..Default::default()
                },
                Decision::Allow,
            ),
            rule(
                "escalate-write-outside-sandbox",
                Condition {
                    roles: Some(vec![ArgumentRole::WritePath]),
                    ..Default::default()
                },
                Decision::Escalate,
            ),
            rule(
                "allow-delete-within-sandbox",
                Condition {
                    paths: Some(PathsCondition {
                        roles: vec![ArgumentRole::DeletePath],
                        within,
                    }),
                    ..Default::default()
                },
                Decision::Allow,
            ),
            rule(
                "deny-delete-outside-sandbox",
                Condition {
                    roles: Some(vec![ArgumentRole::DeletePath]),
                    ..Default::default()
                },
                Decision::Deny,
            ),
            rule(
                "allow-side-effect-free-tools",
                Condition {
                    side_effects: Some(false),
                    ..Default::default()
                },
                Decision::Allow,
            ),
        ]
    }

    fn standard_annotations() -> ToolAnnotationsFile {
        annotations_file(vec![
            annotation("filesystem", "read_file", false, &[(
                "path",
                &[ArgumentRole::ReadPath],
            )]),
            annotation("filesystem", "read_multiple_files", false, &[(
                "paths",
                &[ArgumentRole::ReadPath],
            )]),
            annotation("filesystem", "write_file", true, &[
                ("path", &[ArgumentRole::WritePath]),
                ("content", &[ArgumentRole::None]),
            ]),
            annotation("filesystem", "delete_file", true, &[(
                "path",
                &[ArgumentRole::DeletePath],
            )]),
            annotation("filesystem", "move_file", true, &[
                ("source", &[ArgumentRole::ReadPath, ArgumentRole::DeletePath]),
                ("destination", &[ArgumentRole::WritePath]),
            ]),
            annotation("filesystem", "list_allowed_directories", false, &[]),
            annotation("git", "git_reset", true, &[
                ("path", &[ArgumentRole::WriteHistory]),
                ("mode", &[ArgumentRole::None]),
            ]),
            annotation("fetch", "fetch_url", true, &[(
                "url",
                &[ArgumentRole::FetchUrl],
            )]),
        ])
    }

    fn engine(fx: &Fixture) -> PolicyEngine {
        engine_with(fx, standard_rules(&fx.sandbox), HashMap::new())
    }

    fn engine_with(
        fx: &Fixture,
        rules: Vec<CompiledRule>,
        domain_allowlists: HashMap<String, Vec<String>>,
    ) -> PolicyEngine {
        PolicyEngine::new(EngineConfig {
            policy: CompiledPolicy {
                generated_at: "t".into(),
                constitution_hash: "c".into(),
                input_hash: "i".into(),
                rules,
                list_definitions: None,
            },
            annotations: standard_annotations(),
            protected_paths: vec![fx.protected.clone()],
            sandbox_dir: Some(fx.sandbox.clone()),
            domain_allowlists,
            dynamic_lists: None,
        })
        .unwrap()
    }

    fn call(server: &str, tool: &str, args: Value) -> ToolCallRequest {
        let arguments = match args {
            Value::Object(map) => map,
            _ => panic!("args must be an object"),
        };
        ToolCallRequest::new(server, tool, arguments)
    }

    // ── End-to-end scenarios from the contract ──────────────────────────

    #[test]
    fn read_inside_sandbox_is_structurally_allowed() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "read_file",
            json!({"path": fx.sandbox.join("a.txt").display().to_string()}),
        ));
        assert_eq!(decision.status, Decision::Allow);
        assert_eq!(decision.rule, "structural-sandbox-allow");
    }

    #[test]
    fn traversal_escape_escalates_via_read_rule() {
        let fx = fixture();
        let engine = engine(&fx);
        let escape = format!("{}/../../etc/passwd", fx.sandbox.display());
        let decision = engine.evaluate(&call("filesystem", "read_file", json!({"path": escape})));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "escalate-read-outside-sandbox");
    }

    #[test]
    fn write_outside_sandbox_escalates() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "write_file",
            json!({"path": "/etc/hosts", "content": "x"}),
        ));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "escalate-write-outside-sandbox");
    }

    #[test]
    fn delete_outside_sandbox_is_denied() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "delete_file",
            json!({"path": "/tmp/other.txt"}),
        ));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "deny-delete-outside-sandbox");
    }

    #[test]
    fn zero_argument_query_reaches_phase_two_and_allows() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision =
            engine.evaluate(&call("filesystem", "list_allowed_directories", json!({})));
        assert_eq!(decision.status, Decision::Allow);
        assert_eq!(decision.rule, "allow-side-effect-free-tools");
    }

    #[test]
    fn move_out_of_sandbox_escalates_on_destination() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "move_file",
            json!({
                "source": fx.sandbox.join("a.txt").display().to_string(),
                "destination": "/etc/a.txt",
            }),
        ));
        // Source roles are sandbox-discharged; only the write escalates.
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "escalate-write-outside-sandbox");
    }

    #[test]
    fn move_into_sandbox_is_denied_on_source_delete() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "move_file",
            json!({
                "source": "/etc/a.txt",
                "destination": fx.sandbox.join("a.txt").display().to_string(),
            }),
        ));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "deny-delete-outside-sandbox");
    }

    #[test]
    fn git_history_rewrite_escalates_even_inside_sandbox() {
        let fx = fixture();
        let engine = engine(&fx);
        let repo = fx.sandbox.join("repo");
        std::fs::create_dir(&repo).unwrap();
        let decision = engine.evaluate(&call(
            "git",
            "git_reset",
            json!({"path": repo.display().to_string(), "mode": "hard"}),
        ));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "escalate-git-destructive-ops");
    }

    #[test]
    fn domain_outside_allowlist_escalates_structurally() {
        let fx = fixture();
        let engine = engine_with(
            &fx,
            standard_rules(&fx.sandbox),
            HashMap::from([("fetch".to_string(), vec!["github.com".to_string()])]),
        );
        let decision = engine.evaluate(&call("fetch", "fetch_url", json!({"url": "evil.com"})));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "structural-domain-escalate");
    }

    #[test]
    fn allowed_domain_passes_the_gate_to_phase_two() {
        let fx = fixture();
        let mut rules = standard_rules(&fx.sandbox);
        rules.push(rule(
            "allow-fetch-allowed-domains",
            Condition {
                domains: Some(DomainsCondition {
                    roles: vec![ArgumentRole::FetchUrl],
                    allowed: vec!["github.com".into()],
                }),
                ..Default::default()
            },
            Decision::Allow,
        ));
        let engine = engine_with(
            &fx,
            rules,
            HashMap::from([("fetch".to_string(), vec!["github.com".to_string()])]),
        );
        let decision = engine.evaluate(&call("fetch", "fetch_url", json!({"url": "github.com"})));
        assert_eq!(decision.status, Decision::Allow);
        assert_eq!(decision.rule, "allow-fetch-allowed-domains");
    }

    // ── Structural invariants ───────────────────────────────────────────

    #[test]
    fn protected_path_denies_regardless_of_rules() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "read_file",
            json!({"path": fx.protected.display().to_string()}),
        ));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "structural-protected-path");
    }

    #[test]
    fn sandbox_cannot_override_protection() {
        // A protected path nested inside the sandbox still denies.
        let fx = fixture();
        let nested = fx.sandbox.join("secrets.txt");
        std::fs::write(&nested, "").unwrap();
        let engine = engine_with_protected(&fx, vec![nested.clone()]);
        let decision = engine.evaluate(&call(
            "filesystem",
            "read_file",
            json!({"path": nested.display().to_string()}),
        ));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "structural-protected-path");
    }

    fn engine_with_protected(fx: &Fixture, protected: Vec<PathBuf>) -> PolicyEngine {
        PolicyEngine::new(EngineConfig {
            policy: CompiledPolicy {
                generated_at: "t".into(),
                constitution_hash: "c".into(),
                input_hash: "i".into(),
                rules: standard_rules(&fx.sandbox),
                list_definitions: None,
            },
            annotations: standard_annotations(),
            protected_paths: protected,
            sandbox_dir: Some(fx.sandbox.clone()),
            domain_allowlists: HashMap::new(),
            dynamic_lists: None,
        })
        .unwrap()
    }

    #[test]
    fn heuristic_extraction_catches_unannotated_path_shapes() {
        // `content` is annotated `none`, but a protected path smuggled into
        // it is still caught by the prefix heuristic.
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "write_file",
            json!({
                "path": fx.sandbox.join("out.txt").display().to_string(),
                "content": fx.protected.display().to_string(),
            }),
        ));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "structural-protected-path");
    }

    #[test]
    fn unknown_tool_is_denied() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call("filesystem", "format_disk", json!({})));
        assert_eq!(decision.status, Decision::Deny);
        assert_eq!(decision.rule, "structural-unknown-tool");
    }

    // ── Rule-chain semantics ────────────────────────────────────────────

    #[test]
    fn first_match_wins_within_a_role() {
        let fx = fixture();
        let chain = vec![
            rule(
                "escalate-all-reads",
                Condition {
                    roles: Some(vec![ArgumentRole::ReadPath]),
                    ..Default::default()
                },
                Decision::Escalate,
            ),
            rule(
                "allow-all-reads",
                Condition {
                    roles: Some(vec![ArgumentRole::ReadPath]),
                    ..Default::default()
                },
                Decision::Allow,
            ),
        ];
        let engine = engine_with(&fx, chain, HashMap::new());
        let decision =
            engine.evaluate(&call("filesystem", "read_file", json!({"path": "/etc/motd"})));
        assert_eq!(decision.rule, "escalate-all-reads");
    }

    #[test]
    fn no_matching_rule_defaults_to_escalate() {
        let fx = fixture();
        let engine = engine_with(&fx, Vec::new(), HashMap::new());
        let decision =
            engine.evaluate(&call("filesystem", "read_file", json!({"path": "/etc/motd"})));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "default-escalate");
    }

    #[test]
    fn multi_path_array_requires_every_element_within() {
        let fx = fixture();
        let engine = engine(&fx);
        let inside = fx.sandbox.join("a.txt").display().to_string();

        // Mixed array: one inside, one outside. The paths predicate fails
        // (not all within), so the read falls to the escalate rule.
        let decision = engine.evaluate(&call(
            "filesystem",
            "read_multiple_files",
            json!({"paths": [inside, "/etc/passwd"]}),
        ));
        assert_eq!(decision.status, Decision::Escalate);
        assert_eq!(decision.rule, "escalate-read-outside-sandbox");
    }

    #[test]
    fn malformed_argument_values_do_not_throw() {
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "read_file",
            json!({"path": {"nested": "object"}}),
        ));
        // Non-string path: extraction is empty, the within rule cannot
        // match, the role falls through to escalate.
        assert_eq!(decision.status, Decision::Escalate);
    }

    #[test]
    fn severity_combines_across_roles() {
        // move_file entirely outside the sandbox: read escalates, delete
        // denies, write escalates. Deny wins.
        let fx = fixture();
        let engine = engine(&fx);
        let decision = engine.evaluate(&call(
            "filesystem",
            "move_file",
            json!({"source": "/etc/a.txt", "destination": "/etc/b.txt"}),
        ));
        assert_eq!(decision.status, Decision::Deny);
    }
}
