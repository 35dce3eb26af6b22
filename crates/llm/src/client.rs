//! Anthropic messages-API client over reqwest.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    secrecy::{ExposeSecret, SecretString},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::logging::InteractionLogger;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Usage,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// A model-bound client. Cheap to clone per pipeline stage.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    logger: Option<Arc<InteractionLogger>>,
}

impl LlmClient {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key,
            model: model.into(),
            max_tokens: 8192,
            logger: None,
        }
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_logger(mut self, logger: Arc<InteractionLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One completion. Retries 429 and 5xx responses with exponential
    /// backoff; `step` stamps the interaction log.
    pub async fn complete(
        &self,
        step: &str,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse> {
        let started = std::time::Instant::now();
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages,
        };

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(&body).await {
                Ok(response) => {
                    debug!(
                        step,
                        model = %self.model,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "LLM call complete"
                    );
                    if let Some(logger) = &self.logger {
                        logger.record(
                            step,
                            &self.model,
                            messages,
                            &response.text,
                            &response.usage,
                            started.elapsed(),
                        );
                    }
                    return Ok(response);
                },
                Err(RequestError::Retriable(e)) if attempt < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    warn!(step, attempt, error = %e, backoff_ms = backoff.as_millis() as u64,
                          "retriable LLM error");
                    tokio::time::sleep(backoff).await;
                    last_error = Some(e);
                },
                Err(RequestError::Retriable(e)) | Err(RequestError::Fatal(e)) => {
                    return Err(e.context(format!("LLM call failed at step '{step}'")));
                },
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("LLM call failed"))
            .context(format!("LLM call failed at step '{step}' after {MAX_ATTEMPTS} attempts")))
    }

    async fn send_once(&self, body: &MessagesRequest<'_>) -> std::result::Result<ChatResponse, RequestError> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::Retriable(e.into()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RequestError::Retriable(anyhow::anyhow!(
                "LLM API returned {status}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RequestError::Fatal(anyhow::anyhow!(
                "LLM API returned {status}: {text}"
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("failed to parse LLM response")
            .map_err(RequestError::Fatal)?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            text,
            usage: parsed.usage,
        })
    }
}

enum RequestError {
    Retriable(anyhow::Error),
    Fatal(anyhow::Error),
}
