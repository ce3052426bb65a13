//! Ollama API provider.
//!
//! Calls `POST {host}/api/chat` with an Ollama-native request format.
//!
//! Differences from Anthropic:
//! - System prompt is sent as a `role: "system"` message (not a top-level field).
//! - Token usage: `prompt_eval_count` / `eval_count` (may be absent).
//! - Must set `stream: false` for synchronous responses.
//! - No credentials; `api_key` is ignored.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{AiRequest, AiResponse, Provider};

/// Default Ollama API base URL.
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

// ── Ollama API request types ─────────────────────────────

/// Ollama `/api/chat` request body.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

// ── Ollama API response types ────────────────────────────

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

// ── OllamaProvider ───────────────────────────────────────

pub struct OllamaProvider {
    client: Client,
    host: String,
}

impl OllamaProvider {
    /// If `host` is `None`, defaults to `http://localhost:11434`.
    pub fn new(host: Option<String>) -> Self {
        let host = host.unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
        // Strip trailing slash for consistent URL construction
        let host = host.trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            host,
        }
    }
}

fn build_request(request: &AiRequest) -> OllamaChatRequest {
    let mut messages = Vec::with_capacity(2);
    if !request.system.is_empty() {
        messages.push(OllamaMessage {
            role: "system".to_string(),
            content: request.system.clone(),
        });
    }
    messages.push(OllamaMessage {
        role: "user".to_string(),
        content: request.prompt.clone(),
    });

    OllamaChatRequest {
        model: request.model.clone(),
        messages,
        stream: false,
        options: OllamaOptions {
            num_predict: request.max_tokens,
        },
    }
}

fn into_response(resp: OllamaChatResponse) -> AiResponse {
    if resp.done_reason.as_deref() == Some("length") {
        warn!("Ollama response hit num_predict; the envelope is probably truncated");
    }
    AiResponse {
        text_content: resp.message.content,
        input_tokens: resp.prompt_eval_count.unwrap_or(0),
        output_tokens: resp.eval_count.unwrap_or(0),
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn chat(&self, request: &AiRequest) -> Result<AiResponse> {
        let url = format!("{}/api/chat", self.host);
        debug!("Calling Ollama API ({}) at {url}", request.model);

        let response = self
            .client
            .post(&url)
            .json(&build_request(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({status}): {body}");
        }

        let resp: OllamaChatResponse = response.json().await?;
        let out = into_response(resp);
        info!(
            "AI response: {} in / {} out tokens",
            out.input_tokens, out.output_tokens
        );
        Ok(out)
    }

    fn description(&self) -> String {
        format!("ollama ({})", self.host)
    }
}
