//! `Provider` trait: abstraction over AI backends.
//!
//! Providers (Anthropic, Ollama, …) implement this trait so agent models
//! can name any configured backend through `[providers.<id>]`.

use anyhow::Result;
use async_trait::async_trait;

/// One completion request: a system prompt and a single user prompt.
///
/// The host loop sends the whole envelope as the prompt each turn; nothing
/// is kept provider-side between turns.
#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// Empty when the provider needs no credentials.
    pub api_key: String,
    pub max_tokens: u32,
}

/// Normalized provider response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiResponse {
    pub text_content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Sends `request` and returns the text the model produced.
    async fn chat(&self, request: &AiRequest) -> Result<AiResponse>;

    /// Human-readable description of the provider, e.g. `"anthropic"`.
    fn description(&self) -> String;
}
