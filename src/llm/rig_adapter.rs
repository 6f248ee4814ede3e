//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model so the classifier can drive it.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    provider: &'static str,
    context_length: usize,
    timeout: Duration,
    max_tokens: u32,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
            context_length: 8192,
            timeout: Duration::from_secs(120),
            max_tokens: 1024,
        }
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Used when a request leaves `max_tokens` unset. Anthropic rejects
    /// requests without one.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn failure(&self, err: CompletionError) -> LlmError {
        classify_failure(self.provider, &err.to_string())
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let turns = split_turns(&request.messages).ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "request must end with a user message".into(),
        })?;

        let history: Vec<Message> = turns
            .history
            .iter()
            .map(|m| match m.role {
                Role::Assistant => Message::assistant(m.content.clone()),
                _ => Message::user(m.content.clone()),
            })
            .collect();

        let mut builder = self
            .model
            .completion_request(Message::user(turns.prompt))
            .messages(history)
            .max_tokens(u64::from(request.max_tokens.unwrap_or(self.max_tokens)));
        if let Some(preamble) = turns.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| self.failure(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "no text in response".into(),
            });
        }

        tracing::debug!(
            provider = self.provider,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// A request reshaped for rig: system text becomes the preamble, the last
/// user message is the prompt and everything between is chat history.
#[derive(Debug, PartialEq)]
struct Turns<'a> {
    preamble: Option<String>,
    history: Vec<&'a ChatMessage>,
    prompt: String,
}

fn split_turns(messages: &[ChatMessage]) -> Option<Turns<'_>> {
    let (last, rest) = messages.split_last()?;
    if last.role != Role::User {
        return None;
    }
    let system: Vec<&str> = rest
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    Some(Turns {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: rest.iter().filter(|m| m.role != Role::System).collect(),
        prompt: last.content.clone(),
    })
}

/// rig flattens HTTP failures into text, so status is recovered from it.
fn classify_failure(provider: &str, text: &str) -> LlmError {
    let lower = text.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401")
        || lower.contains("authentication_error")
        || lower.contains("invalid x-api-key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: text.to_string(),
        }
    }
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}
