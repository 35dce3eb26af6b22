//! JSONL log of every LLM interaction, stamped with the pipeline step.

use std::{path::Path, time::Duration};

use {
    chrono::{DateTime, Utc},
    ironcurtain_common::JsonlWriter,
    serde::{Deserialize, Serialize},
};

use crate::client::{ChatMessage, Usage};

/// One logged interaction.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    /// Pipeline step (`annotate-tools`, `compile-constitution`, ...).
    pub step: String,
    pub model: String,
    pub request: Vec<ChatMessage>,
    pub response: String,
    pub usage: Usage,
    pub duration_ms: u64,
}

/// Appends interaction records to `generated/llm-interactions.jsonl`.
pub struct InteractionLogger {
    writer: JsonlWriter,
}

impl InteractionLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            writer: JsonlWriter::new(path.as_ref()),
        }
    }

    pub fn record(
        &self,
        step: &str,
        model: &str,
        request: &[ChatMessage],
        response: &str,
        usage: &Usage,
        duration: Duration,
    ) {
        self.writer.append_best_effort(&InteractionRecord {
            timestamp: Utc::now(),
            step: step.into(),
            model: model.into(),
            request: request.to_vec(),
            response: response.into(),
            usage: usage.clone(),
            duration_ms: duration.as_millis() as u64,
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_stamped_with_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm-interactions.jsonl");
        let logger = InteractionLogger::new(&path);

        logger.record(
            "annotate-tools",
            "claude-sonnet-4-5",
            &[ChatMessage::user("annotate these")],
            "[]",
            &Usage {
                input_tokens: 100,
                output_tokens: 5,
            },
            Duration::from_millis(420),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let record: InteractionRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record.step, "annotate-tools");
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.duration_ms, 420);
    }
}
