//! Test scenarios: concrete tool calls with expected decisions, used by the
//! pipeline's verify stage.

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::request::Decision;

/// Where a scenario came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioSource {
    Handwritten,
    Generated,
}

/// Expected outcome. `NotAllow` accepts either deny or escalate — useful
/// for cases where the exact severity is a policy choice but silently
/// allowing would be a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpectedDecision {
    Allow,
    Deny,
    Escalate,
    NotAllow,
}

impl ExpectedDecision {
    pub fn accepts(self, actual: Decision) -> bool {
        match self {
            ExpectedDecision::Allow => actual == Decision::Allow,
            ExpectedDecision::Deny => actual == Decision::Deny,
            ExpectedDecision::Escalate => actual == Decision::Escalate,
            ExpectedDecision::NotAllow => actual != Decision::Allow,
        }
    }
}

/// The call a scenario exercises.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRequest {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// One test scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestScenario {
    pub description: String,
    pub request: ScenarioRequest,
    pub expected_decision: ExpectedDecision,
    pub reasoning: String,
    pub source: ScenarioSource,
}

/// The persisted test-scenarios artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioFile {
    pub generated_at: String,
    pub input_hash: String,
    pub scenarios: Vec<TestScenario>,
}

impl ScenarioFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenarios: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid scenarios: {}", path.display()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_allow_accepts_both_restrictive_outcomes() {
        assert!(ExpectedDecision::NotAllow.accepts(Decision::Deny));
        assert!(ExpectedDecision::NotAllow.accepts(Decision::Escalate));
        assert!(!ExpectedDecision::NotAllow.accepts(Decision::Allow));
    }

    #[test]
    fn exact_expectations_accept_only_themselves() {
        assert!(ExpectedDecision::Escalate.accepts(Decision::Escalate));
        assert!(!ExpectedDecision::Escalate.accepts(Decision::Deny));
    }

    #[test]
    fn scenario_json_round_trips() {
        let scenario = TestScenario {
            description: "read inside sandbox".into(),
            request: ScenarioRequest {
                server_name: "filesystem".into(),
                tool_name: "read_file".into(),
                arguments: serde_json::from_str(r#"{"path": "/tmp/sandbox/a.txt"}"#).unwrap(),
            },
            expected_decision: ExpectedDecision::Allow,
            reasoning: "sandbox containment".into(),
            source: ScenarioSource::Handwritten,
        };
        let json = serde_json::to_string(&scenario).unwrap();
        assert!(json.contains(r#""expectedDecision":"allow""#));
        assert!(json.contains(r#""source":"handwritten""#));
        let parsed: TestScenario = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.expected_decision, ExpectedDecision::Allow);
    }
}
