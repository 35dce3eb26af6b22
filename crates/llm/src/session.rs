//! Stateful multi-turn chat session.
//!
//! The conversation history is an explicit append-only list, not hidden
//! state on the model object. The fixed system prompt is re-sent with every
//! turn so provider-side prompt caching stays effective across the
//! verify-repair loop.

use anyhow::Result;

use crate::client::{ChatMessage, LlmClient};

pub struct ChatSession {
    client: LlmClient,
    system: String,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(client: LlmClient, system: impl Into<String>) -> Self {
        Self {
            client,
            system: system.into(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Append a user turn, run the model over the whole history, append the
    /// assistant turn, and return its text.
    pub async fn send(&mut self, step: &str, content: impl Into<String>) -> Result<String> {
        self.history.push(ChatMessage::user(content));
        let response = self
            .client
            .complete(step, &self.system, &self.history)
            .await?;
        self.history.push(ChatMessage::assistant(response.text.clone()));
        Ok(response.text)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::client::Role, secrecy::SecretString};

    #[tokio::test]
    async fn history_accumulates_turn_pairs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(
                r#"{"content": [{"type": "text", "text": "ok"}],
                    "usage": {"input_tokens": 1, "output_tokens": 1}}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let client = LlmClient::new(SecretString::new("k".into()), "claude-sonnet-4-5")
            .with_base_url(server.url());
        let mut session = ChatSession::new(client, "you are a compiler");

        session.send("compile", "first").await.unwrap();
        session.send("compile", "second").await.unwrap();

        let roles: Vec<Role> = session.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(session.history()[2].content, "second");
    }

    #[tokio::test]
    async fn failed_turn_keeps_the_user_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(400)
            .with_body("{}")
            .create_async()
            .await;

        let client = LlmClient::new(SecretString::new("k".into()), "claude-sonnet-4-5")
            .with_base_url(server.url());
        let mut session = ChatSession::new(client, "");
        assert!(session.send("compile", "hello").await.is_err());
        assert_eq!(session.history().len(), 1);
    }
}
