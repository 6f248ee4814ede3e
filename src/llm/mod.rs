//! LLM integration.
//!
//! Supports:
//! - **Anthropic**: Messages API via rig-core
//! - **Ollama**: local server via rig-core
//!
//! rig-core handles HTTP transport; `RigAdapter` bridges rig's
//! `CompletionModel` trait to our `LlmProvider` trait. One provider is chosen
//! from configuration at startup and shared behind `Arc<dyn LlmProvider>` for
//! the life of the service.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::LlmSettings;
use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Anthropic,
    Ollama,
}

/// Create an LLM provider from configuration.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match settings.provider {
        LlmBackend::Anthropic => create_anthropic_provider(settings),
        LlmBackend::Ollama => create_ollama_provider(settings),
    }
}

fn create_anthropic_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let api_key = settings.api_key.as_ref().ok_or_else(|| LlmError::AuthFailed {
        provider: "anthropic".to_string(),
    })?;
    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: format!("Failed to create Anthropic client: {e}"),
        })?;
    let model = client.completion_model(&settings.model);
    tracing::info!("Using Anthropic (model: {})", settings.model);
    Ok(Arc::new(adapt(RigAdapter::new(model, &settings.model, "anthropic"), settings)))
}

fn create_ollama_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::ollama;

    let client: ollama::Client = ollama::Client::builder()
        .api_key(rig::client::Nothing)
        .base_url(&settings.ollama_base_url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "ollama".to_string(),
            reason: format!("Failed to create Ollama client: {e}"),
        })?;
    let model = client.completion_model(&settings.model);
    tracing::info!(
        "Using Ollama at {} (model: {})",
        settings.ollama_base_url,
        settings.model
    );
    Ok(Arc::new(adapt(RigAdapter::new(model, &settings.model, "ollama"), settings)))
}

fn adapt<M: rig::completion::CompletionModel>(
    adapter: RigAdapter<M>,
    settings: &LlmSettings,
) -> RigAdapter<M> {
    adapter
        .with_context_length(settings.context_length)
        .with_timeout(Duration::from_secs(settings.timeout_secs))
        .with_max_tokens(settings.max_tokens)
}
