//! Ollama-backed generation role

use async_trait::async_trait;
use tracing::debug;

use super::{GenerationRole, RoleError, RoleId};
use crate::ollama::{ChatClient, ChatError, ChatMessage};

/// A role = a model + a system prompt; the context is the single user turn
pub struct OllamaRole {
    client: ChatClient,
    role: RoleId,
    model: String,
    system_prompt: String,
}

impl OllamaRole {
    pub fn new(
        client: ChatClient,
        role: RoleId,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            client,
            role,
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl From<ChatError> for RoleError {
    fn from(e: ChatError) -> Self {
        match e {
            e if e.is_timeout() => RoleError::Timeout,
            ChatError::EmptyResponse => RoleError::Empty,
            other => RoleError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl GenerationRole for OllamaRole {
    async fn invoke(&self, context: &str) -> Result<String, RoleError> {
        let messages = [
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(context),
        ];

        let response = self.client.chat(&messages, &self.model).await?;
        debug!(
            role = %self.role,
            model = %self.model,
            eval_count = response.eval_count,
            eval_ms = response.eval_duration / 1_000_000,
            "Model replied"
        );

        let reply = response.message.content.trim().to_string();
        if reply.is_empty() {
            return Err(RoleError::Empty);
        }
        Ok(reply)
    }
}
