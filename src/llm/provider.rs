//! LLM provider trait and request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

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

/// A single request/response exchange. No multi-turn state is kept by providers.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Rough prompt size in tokens (4 characters per token).
    pub fn estimated_prompt_tokens(&self) -> usize {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        chars.div_ceil(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Other,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

/// A chat-completion backend. One variant is selected at startup from
/// configuration and held for the life of the service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identity recorded in classification results.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Context window in tokens (prompt plus completion).
    fn context_length(&self) -> usize;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_sampling_params() {
        let req = CompletionRequest::new(vec![ChatMessage::system("s"), ChatMessage::user("u")])
            .with_max_tokens(150)
            .with_temperature(0.1);
        assert_eq!(req.max_tokens, Some(150));
        assert_eq!(req.temperature, Some(0.1));
        assert_eq!(req.messages[0].role, Role::System);
    }

    #[test]
    fn prompt_token_estimate_rounds_up() {
        let req = CompletionRequest::new(vec![ChatMessage::user("abcde")]);
        assert_eq!(req.estimated_prompt_tokens(), 2);
    }
}
