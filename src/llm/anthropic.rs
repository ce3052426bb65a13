//! Anthropic Messages API provider.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{AiRequest, AiResponse, Provider};

const DEFAULT_ANTHROPIC_HOST: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    host: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
    /// `host` overrides the API base URL (proxies, tests).
    pub fn new(host: Option<String>) -> Self {
        let host = host.unwrap_or_else(|| DEFAULT_ANTHROPIC_HOST.to_string());
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
        }
    }
}

fn build_request(request: &AiRequest) -> MessagesRequest<'_> {
    MessagesRequest {
        model: &request.model,
        max_tokens: request.max_tokens,
        system: &request.system,
        messages: vec![Message {
            role: "user",
            content: &request.prompt,
        }],
    }
}

fn into_response(resp: MessagesResponse) -> AiResponse {
    let text_content = resp
        .content
        .iter()
        .filter_map(|block| {
            if block.block_type == "text" {
                block.text.clone()
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    if resp.stop_reason.as_deref() == Some("max_tokens") {
        warn!("Claude response hit max_tokens; the envelope is probably truncated");
    }

    let (input_tokens, output_tokens) = resp
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));

    AiResponse {
        text_content,
        input_tokens,
        output_tokens,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, request: &AiRequest) -> Result<AiResponse> {
        debug!("Calling Claude API ({})", request.model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.host))
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&build_request(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error ({status}): {body}");
        }

        let resp: MessagesResponse = response.json().await?;
        let out = into_response(resp);
        info!(
            "AI response: {} in / {} out tokens",
            out.input_tokens, out.output_tokens
        );
        Ok(out)
    }

    fn description(&self) -> String {
        if self.host == DEFAULT_ANTHROPIC_HOST {
            "anthropic".to_string()
        } else {
            format!("anthropic ({})", self.host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AiRequest {
        AiRequest {
            model: "claude-sonnet-4-5-20250929".to_string(),
            system: "You are a test.".to_string(),
            prompt: "<<<ENVELOPE>>>".to_string(),
            api_key: "sk-test".to_string(),
            max_tokens: 1024,
        }
    }

    #[test]
    fn test_request_serialization() {
        let req = request();
        let json = serde_json::to_value(build_request(&req)).unwrap();
        assert_eq!(json["model"], "claude-sonnet-4-5-20250929");
        assert_eq!(json["max_tokens"], 1024);
        assert_eq!(json["system"], "You are a test.");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "<<<ENVELOPE>>>");
        // The key goes in a header, never in the body.
        assert!(!json.to_string().contains("sk-test"));
    }

    #[test]
    fn test_response_joins_text_blocks() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "first"},
                    {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                    {"type": "text", "text": "second"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 34}
            }"#,
        )
        .unwrap();
        let out = into_response(resp);
        assert_eq!(out.text_content, "first\nsecond");
        assert_eq!(out.input_tokens, 12);
        assert_eq!(out.output_tokens, 34);
    }

    #[test]
    fn test_response_without_usage() {
        let resp: MessagesResponse = serde_json::from_str(r#"{"content": []}"#).unwrap();
        let out = into_response(resp);
        assert_eq!(out, AiResponse::default());
    }

    #[test]
    fn test_description_and_host() {
        assert_eq!(AnthropicProvider::new(None).description(), "anthropic");
        let proxied = AnthropicProvider::new(Some("http://proxy:8080/".to_string()));
        assert_eq!(proxied.host, "http://proxy:8080");
        assert_eq!(proxied.description(), "anthropic (http://proxy:8080)");
    }
}
