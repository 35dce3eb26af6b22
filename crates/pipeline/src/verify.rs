//! Stage 5: verify the compiled policy against the scenarios.
//!
//! Scenarios run against the real engine, not a model. Mismatches go to a
//! judge model that separates scenario bugs (corrections, discards) from
//! policy bugs (feedback for the compiler session), and may add probe
//! scenarios for coverage gaps.

use {
    anyhow::{Context, Result},
    ironcurtain_llm::{ChatMessage, LlmClient},
    ironcurtain_policy::{
        ExpectedDecision, PolicyDecision, PolicyEngine, ScenarioSource, TestScenario,
        ToolCallRequest,
    },
    serde::Deserialize,
    tracing::{info, warn},
};

use crate::artifacts::extract_json;

const JUDGE_SYSTEM: &str = "\
You review mismatches between a policy engine's decisions and a test \
scenario's expectations. For each mismatch decide: is the scenario wrong \
(the expectation should be corrected), is the scenario invalid (it fights \
a structural invariant like protected paths and should be discarded), or \
is the policy wrong (describe the defect so the compiler can fix the \
rules)? You may also add probe scenarios for coverage gaps you notice. \
Reply with JSON only: {\"corrections\": [{\"index\": n, \
\"expectedDecision\": \"allow\"|\"deny\"|\"escalate\"|\"not-allow\"}], \
\"discards\": [n], \"feedback\": string, \"probes\": [scenario]}. Leave \
\"feedback\" empty when the rules are fine.";

/// One scenario whose engine decision contradicts its expectation.
#[derive(Debug, Clone)]
pub struct Mismatch {
    pub index: usize,
    pub scenario: TestScenario,
    pub actual: PolicyDecision,
}

/// Run every scenario against the engine.
pub fn run_scenarios(engine: &PolicyEngine, scenarios: &[TestScenario]) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    for (index, scenario) in scenarios.iter().enumerate() {
        let request = ToolCallRequest::new(
            &scenario.request.server_name,
            &scenario.request.tool_name,
            scenario.request.arguments.clone(),
        );
        let actual = engine.evaluate(&request);
        if !scenario.expected_decision.accepts(actual.status) {
            mismatches.push(Mismatch {
                index,
                scenario: scenario.clone(),
                actual,
            });
        }
    }
    mismatches
}

/// Structured judge output.
#[derive(Debug, Default, Deserialize)]
pub struct JudgeFeedback {
    #[serde(default)]
    pub corrections: Vec<Correction>,
    #[serde(default)]
    pub discards: Vec<usize>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub probes: Vec<TestScenario>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    pub index: usize,
    pub expected_decision: ExpectedDecision,
}

/// Ask the judge to triage the mismatches.
pub async fn judge_mismatches(
    client: &LlmClient,
    constitution: &str,
    mismatches: &[Mismatch],
) -> Result<JudgeFeedback> {
    let mut listing = String::new();
    for m in mismatches {
        listing.push_str(&format!(
            "- index {}: {} — expected {:?}, engine said {:?} (rule '{}', {})\n  request: {}/{} {}\n",
            m.index,
            m.scenario.description,
            m.scenario.expected_decision,
            m.actual.status,
            m.actual.rule,
            m.actual.reason,
            m.scenario.request.server_name,
            m.scenario.request.tool_name,
            serde_json::Value::Object(m.scenario.request.arguments.clone()),
        ));
    }
    let prompt = format!("Constitution:\n{constitution}\n\nMismatches:\n{listing}");
    let response = client
        .complete("verify-judge", JUDGE_SYSTEM, &[ChatMessage::user(prompt)])
        .await?;
    serde_json::from_str(extract_json(&response.text)).context("unparseable judge feedback")
}

/// Apply corrections, discards, and probes to the scenario list.
///
/// Handwritten scenarios are the contract: the judge may not correct or
/// discard them, only generated ones.
pub fn apply_feedback(scenarios: &mut Vec<TestScenario>, feedback: &JudgeFeedback) {
    for correction in &feedback.corrections {
        match scenarios.get_mut(correction.index) {
            Some(scenario) if scenario.source == ScenarioSource::Generated => {
                info!(
                    index = correction.index,
                    expected = ?correction.expected_decision,
                    "correcting generated scenario"
                );
                scenario.expected_decision = correction.expected_decision;
            },
            Some(_) => {
                warn!(index = correction.index, "judge tried to correct a handwritten scenario");
            },
            None => warn!(index = correction.index, "correction index out of range"),
        }
    }

    let mut discard_indices: Vec<usize> = feedback
        .discards
        .iter()
        .copied()
        .filter(|&i| {
            matches!(
                scenarios.get(i).map(|s| s.source),
                Some(ScenarioSource::Generated)
            )
        })
        .collect();
    discard_indices.sort_unstable();
    for index in discard_indices.into_iter().rev() {
        info!(index, "discarding generated scenario");
        scenarios.remove(index);
    }

    for mut probe in feedback.probes.clone() {
        probe.source = ScenarioSource::Generated;
        scenarios.push(probe);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        ironcurtain_policy::{
            ArgumentRole, CompiledPolicy, CompiledRule, Condition, Decision, EngineConfig,
            ScenarioRequest, ServerAnnotations, ToolAnnotation, ToolAnnotationsFile,
        },
        std::collections::HashMap,
    };

    fn engine(rules: Vec<CompiledRule>) -> PolicyEngine {
        let annotations = ToolAnnotationsFile {
            generated_at: "t".into(),
            servers: HashMap::from([("filesystem".into(), ServerAnnotations {
                input_hash: "h".into(),
                tools: vec![ToolAnnotation {
                    tool_name: "read_file".into(),
                    server_name: "filesystem".into(),
                    comment: String::new(),
                    side_effects: false,
                    args: HashMap::from([("path".into(), vec![ArgumentRole::ReadPath])]),
                }],
            })]),
        };
        PolicyEngine::new(EngineConfig {
            policy: CompiledPolicy {
                generated_at: "t".into(),
                constitution_hash: "c".into(),
                input_hash: "i".into(),
                rules,
                list_definitions: None,
            },
            annotations,
            protected_paths: Vec::new(),
            sandbox_dir: None,
            domain_allowlists: HashMap::new(),
            dynamic_lists: None,
        })
        .unwrap()
    }

    fn scenario(expected: ExpectedDecision, source: ScenarioSource) -> TestScenario {
        TestScenario {
            description: "read a system file".into(),
            request: ScenarioRequest {
                server_name: "filesystem".into(),
                tool_name: "read_file".into(),
                arguments: serde_json::from_str(r#"{"path": "/etc/motd"}"#).unwrap(),
            },
            expected_decision: expected,
            reasoning: String::new(),
            source,
        }
    }

    fn allow_reads_rule() -> CompiledRule {
        CompiledRule {
            name: "allow-all-reads".into(),
            description: "reads are fine".into(),
            principle: "p".into(),
            condition: Condition {
                roles: Some(vec![ArgumentRole::ReadPath]),
                ..Default::default()
            },
            then: Decision::Allow,
            reason: "read".into(),
        }
    }

    #[test]
    fn matching_scenarios_produce_no_mismatch() {
        let engine = engine(vec![allow_reads_rule()]);
        let scenarios = vec![scenario(ExpectedDecision::Allow, ScenarioSource::Handwritten)];
        assert!(run_scenarios(&engine, &scenarios).is_empty());
    }

    #[test]
    fn contradicting_scenarios_are_mismatches() {
        let engine = engine(vec![allow_reads_rule()]);
        let scenarios = vec![scenario(ExpectedDecision::Deny, ScenarioSource::Generated)];
        let mismatches = run_scenarios(&engine, &scenarios);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].actual.status, Decision::Allow);
    }

    #[test]
    fn not_allow_accepts_the_default_escalation() {
        let engine = engine(Vec::new());
        let scenarios = vec![scenario(ExpectedDecision::NotAllow, ScenarioSource::Generated)];
        assert!(run_scenarios(&engine, &scenarios).is_empty());
    }

    #[test]
    fn corrections_only_touch_generated_scenarios() {
        let mut scenarios = vec![
            scenario(ExpectedDecision::Deny, ScenarioSource::Handwritten),
            scenario(ExpectedDecision::Deny, ScenarioSource::Generated),
        ];
        let feedback = JudgeFeedback {
            corrections: vec![
                Correction {
                    index: 0,
                    expected_decision: ExpectedDecision::Allow,
                },
                Correction {
                    index: 1,
                    expected_decision: ExpectedDecision::Allow,
                },
            ],
            ..Default::default()
        };
        apply_feedback(&mut scenarios, &feedback);
        assert_eq!(scenarios[0].expected_decision, ExpectedDecision::Deny);
        assert_eq!(scenarios[1].expected_decision, ExpectedDecision::Allow);
    }

    #[test]
    fn discards_remove_generated_scenarios_back_to_front() {
        let mut scenarios = vec![
            scenario(ExpectedDecision::Allow, ScenarioSource::Generated),
            scenario(ExpectedDecision::Deny, ScenarioSource::Generated),
            scenario(ExpectedDecision::Escalate, ScenarioSource::Handwritten),
        ];
        let feedback = JudgeFeedback {
            discards: vec![1, 0, 2],
            ..Default::default()
        };
        apply_feedback(&mut scenarios, &feedback);
        // Both generated scenarios gone, the handwritten one untouched.
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].source, ScenarioSource::Handwritten);
    }

    #[test]
    fn probes_are_appended_as_generated() {
        let mut scenarios = Vec::new();
        let feedback = JudgeFeedback {
            probes: vec![scenario(ExpectedDecision::NotAllow, ScenarioSource::Handwritten)],
            ..Default::default()
        };
        apply_feedback(&mut scenarios, &feedback);
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].source, ScenarioSource::Generated);
    }

    #[test]
    fn judge_feedback_parses_with_missing_fields() {
        let feedback: JudgeFeedback = serde_json::from_str(r#"{"feedback": "rule 3 is wrong"}"#).unwrap();
        assert!(feedback.corrections.is_empty());
        assert_eq!(feedback.feedback, "rule 3 is wrong");
    }
}
