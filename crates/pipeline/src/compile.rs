//! Stage 3: compile the constitution into the declarative rule set.
//!
//! The compiler is a stateful chat session: the fixed system prompt holds
//! the constitution, annotations, and rule schema, and the verify-repair
//! loop appends turns. Output is always a complete rule set — the chain is
//! order-sensitive, so partial diffs would silently change behavior.

use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    ironcurtain_llm::{ChatSession, LlmClient},
    ironcurtain_policy::{CompiledPolicy, CompiledRule, ToolAnnotationsFile},
    tracing::info,
};

use crate::artifacts::{content_hash, extract_json, generated_at};

const RULE_SCHEMA: &str = r#"Each rule is:
{ "name": string, "description": string, "principle": string,
  "if": { "server": [string]?, "tool": [string]?, "sideEffects": bool?,
          "roles": [role]?,
          "paths": { "roles": [role], "within": absolute-path }?,
          "domains": { "roles": [role], "allowed": [string] }?,
          "lists": [{ "roles": [role], "allowed": [string],
                      "matchType": "domains"|"emails"|"identifiers" }]? },
  "then": "allow"|"deny"|"escalate", "reason": string }
Rule order is significant: first match wins within each role. Do not write
rules about protected paths or unknown tools — those are enforced in code
and rejected by validation. Paths in "within" must be absolute."#;

pub fn constitution_hash(constitution: &str) -> String {
    content_hash(&[constitution])
}

/// Hash of everything that feeds the compiler.
pub fn compile_input_hash(
    constitution: &str,
    annotations: &ToolAnnotationsFile,
    sandbox_dir: &Path,
    protected_paths: &[PathBuf],
) -> String {
    let annotations_json = stable_annotations_json(annotations);
    let protected = protected_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    content_hash(&[
        constitution,
        &annotations_json,
        &sandbox_dir.display().to_string(),
        &protected,
        RULE_SCHEMA,
    ])
}

/// Server maps hash identically regardless of in-memory ordering.
pub fn stable_annotations_json(annotations: &ToolAnnotationsFile) -> String {
    let sorted: std::collections::BTreeMap<_, _> = annotations.servers.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn system_prompt(
    constitution: &str,
    annotations: &ToolAnnotationsFile,
    sandbox_dir: &Path,
    protected_paths: &[PathBuf],
) -> String {
    let annotations_json =
        serde_json::to_string_pretty(&annotations.servers).unwrap_or_default();
    format!(
        "You compile a natural-language constitution into a declarative rule set \
         for a tool-call policy engine.\n\n{RULE_SCHEMA}\n\n\
         The agent sandbox directory is {sandbox}. Calls touching only the sandbox \
         are generally safe; calls outside it follow the constitution.\n\
         (Protected-path handling is built into the engine; never restate it.)\n\
         Protected paths, for context only: {protected:?}\n\n\
         Constitution:\n{constitution}\n\nTool annotations:\n{annotations_json}\n\n\
         Always reply with the complete JSON array of rules, nothing else.",
        sandbox = sandbox_dir.display(),
        protected = protected_paths,
    )
}

/// The stateful compiler session.
pub struct CompilerSession {
    session: ChatSession,
}

impl CompilerSession {
    pub fn new(
        client: LlmClient,
        constitution: &str,
        annotations: &ToolAnnotationsFile,
        sandbox_dir: &Path,
        protected_paths: &[PathBuf],
    ) -> Self {
        Self {
            session: ChatSession::new(
                client,
                system_prompt(constitution, annotations, sandbox_dir, protected_paths),
            ),
        }
    }

    /// First turn: produce the full rule set.
    pub async fn initial_rules(&mut self) -> Result<Vec<CompiledRule>> {
        let text = self
            .session
            .send("compile-constitution", "Produce the complete rule set.")
            .await?;
        parse_rules(&text)
    }

    /// Repair turn: feed verification feedback and get a corrected complete
    /// rule set. When the session has no prior turn (cached compile), the
    /// current rules are included so the model has the full chain.
    pub async fn repair(
        &mut self,
        feedback: &str,
        current_rules: &[CompiledRule],
    ) -> Result<Vec<CompiledRule>> {
        let prompt = if self.session.history().is_empty() {
            format!(
                "The current rule set is:\n{}\n\nVerification found problems:\n{feedback}\n\n\
                 Reply with the complete corrected rule set.",
                serde_json::to_string_pretty(current_rules)?
            )
        } else {
            format!(
                "Verification found problems:\n{feedback}\n\n\
                 Reply with the complete corrected rule set."
            )
        };
        let text = self.session.send("compile-repair", prompt).await?;
        parse_rules(&text)
    }
}

fn parse_rules(text: &str) -> Result<Vec<CompiledRule>> {
    serde_json::from_str(extract_json(text)).context("unparseable rule set from compiler")
}

/// Assemble and statically validate the compiled-policy artifact.
pub fn build_policy(
    rules: Vec<CompiledRule>,
    constitution: &str,
    input_hash: String,
) -> Result<CompiledPolicy> {
    let mut policy = CompiledPolicy {
        generated_at: generated_at(),
        constitution_hash: constitution_hash(constitution),
        input_hash,
        rules,
        list_definitions: None,
    };
    policy.normalize_legacy_names();
    policy.validate()?;
    info!(rules = policy.rules.len(), "compiled policy validated");
    Ok(policy)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, ironcurtain_policy::Decision};

    fn annotations() -> ToolAnnotationsFile {
        ToolAnnotationsFile {
            generated_at: "t".into(),
            servers: Default::default(),
        }
    }

    #[test]
    fn input_hash_tracks_every_input() {
        let a = annotations();
        let base = compile_input_hash("be safe", &a, Path::new("/tmp/sb"), &[]);
        assert_eq!(
            base,
            compile_input_hash("be safe", &a, Path::new("/tmp/sb"), &[])
        );
        assert_ne!(
            base,
            compile_input_hash("be bold", &a, Path::new("/tmp/sb"), &[])
        );
        assert_ne!(
            base,
            compile_input_hash("be safe", &a, Path::new("/tmp/other"), &[])
        );
        assert_ne!(
            base,
            compile_input_hash(
                "be safe",
                &a,
                Path::new("/tmp/sb"),
                &[PathBuf::from("/etc")]
            )
        );
    }

    #[test]
    fn parse_accepts_fenced_rule_arrays() {
        let text = r#"```json
        [{"name": "allow-reads", "description": "d", "principle": "p",
          "if": {"roles": ["read-path"]}, "then": "allow", "reason": "r"}]
        ```"#;
        let rules = parse_rules(text).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].then, Decision::Allow);
    }

    #[test]
    fn build_policy_rejects_structural_rules() {
        let rules = vec![CompiledRule {
            name: "structural-protected-path".into(),
            description: "d".into(),
            principle: "p".into(),
            condition: Default::default(),
            then: Decision::Deny,
            reason: "r".into(),
        }];
        assert!(build_policy(rules, "c", "h".into()).is_err());
    }

    #[test]
    fn build_policy_stamps_hashes() {
        let policy = build_policy(Vec::new(), "constitution text", "input-h".into()).unwrap();
        assert_eq!(policy.constitution_hash, constitution_hash("constitution text"));
        assert_eq!(policy.input_hash, "input-h");
    }

    #[tokio::test]
    async fn repair_on_a_fresh_session_includes_current_rules() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_body(mockito::Matcher::Regex("old-rule-name".into()))
            .with_status(200)
            .with_body(
                r#"{"content": [{"type": "text", "text": "[]"}],
                    "usage": {"input_tokens": 1, "output_tokens": 1}}"#,
            )
            .create_async()
            .await;

        let client = LlmClient::new(secrecy::SecretString::new("k".into()), "m")
            .with_base_url(server.url());
        let mut session =
            CompilerSession::new(client, "c", &annotations(), Path::new("/tmp/sb"), &[]);
        let current = vec![CompiledRule {
            name: "old-rule-name".into(),
            description: "d".into(),
            principle: "p".into(),
            condition: Default::default(),
            then: Decision::Allow,
            reason: "r".into(),
        }];
        let repaired = session.repair("rule is wrong", &current).await.unwrap();
        assert!(repaired.is_empty());
        mock.assert_async().await;
    }
}
