//! Builtin tool: fetch a URL and extract readable text content.
//!
//! HTML is converted to plain text and truncated to fit an agent's
//! context window. The call declares the worst case it may transfer
//! (`max_bytes`) up front, so net limits apply before any request is sent.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::policy::{CapRequirement, ToolMeta, Usage};
use crate::tools::{required_str, Tool, ToolContext};

/// Maximum raw response body size (5 MB).
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum text output returned to the agent (in characters).
const MAX_TEXT_OUTPUT: usize = 20_000;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Text wrapping width for html2text conversion.
const TEXT_WIDTH: usize = 100;

const USER_AGENT: &str = concat!("turnward/", env!("CARGO_PKG_VERSION"));

pub struct NetFetchTool {
    client: reqwest::Client,
}

impl NetFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(READ_TIMEOUT_SECS))
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            // Stay within the granted host:port.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }
}

impl Default for NetFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

/// The parsed request: URL, its `host:port` scope and the byte ceiling.
struct FetchTarget {
    url: Url,
    scope: String,
    max_bytes: u64,
}

fn target(params: &Value) -> anyhow::Result<FetchTarget> {
    let url_str = required_str(params, "url")?;
    let url = Url::parse(url_str).map_err(|e| anyhow!("invalid URL: {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => bail!("unsupported scheme '{scheme}' (only http/https)"),
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host: {url_str}"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("URL has no port: {url_str}"))?;

    let max_bytes = match params.get("max_bytes") {
        None | Some(Value::Null) => MAX_RESPONSE_SIZE,
        Some(v) => v
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| anyhow!("max_bytes must be a positive integer"))?
            .min(MAX_RESPONSE_SIZE),
    };

    Ok(FetchTarget {
        scope: format!("{host}:{port}"),
        url,
        max_bytes,
    })
}

/// Returns true if the content type looks like HTML.
fn is_html(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml")
}

/// Returns true if the content type is textual (plain, json, xml, etc.).
fn is_text(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/") || ct.contains("application/json") || ct.contains("application/xml")
}

fn extract_text(content_type: &str, body: &[u8]) -> anyhow::Result<String> {
    if is_html(content_type) {
        Ok(html2text::from_read(body, TEXT_WIDTH)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()))
    } else if is_text(content_type) {
        Ok(String::from_utf8_lossy(body).into_owned())
    } else {
        let text = String::from_utf8_lossy(body);
        if text.chars().take(200).any(|c| c == '\0') {
            bail!("cannot extract text from binary content ({content_type})")
        }
        Ok(text.into_owned())
    }
}

fn format_result(url: &str, text: &str) -> String {
    let mut output = format!("Content from: {url}\n\n");

    if text.is_empty() {
        output.push_str("[No text content extracted]");
        return output;
    }

    if text.chars().count() > MAX_TEXT_OUTPUT {
        let truncated: String = text.chars().take(MAX_TEXT_OUTPUT).collect();
        output.push_str(&truncated);
        output.push_str(&format!("\n\n[Content truncated at {MAX_TEXT_OUTPUT} characters]"));
    } else {
        output.push_str(text);
    }

    output
}

#[async_trait]
impl Tool for NetFetchTool {
    fn name(&self) -> &str {
        "net.fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page over HTTP(S) and return its readable text, stripped of HTML markup. \
         Redirects are not followed. 'max_bytes' caps the response size."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http:// or https://)"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Largest response body accepted, in bytes"
                }
            },
            "required": ["url"]
        })
    }

    fn meta(&self, params: &Value) -> anyhow::Result<ToolMeta> {
        let target = target(params)?;
        Ok(ToolMeta {
            required_caps: vec![CapRequirement::new("net", "get", target.scope)],
            usage: Usage {
                net_calls: 1,
                net_bytes: target.max_bytes,
                ..Usage::default()
            },
            ..ToolMeta::new(self.name())
        })
    }

    async fn execute(&self, params: Value, _context: &ToolContext) -> anyhow::Result<String> {
        let target = target(&params)?;
        let url = target.url.as_str();
        debug!("Fetching URL: {url}");

        let mut response = self.client.get(url).send().await.map_err(|e| {
            warn!("URL fetch failed: {e}");
            anyhow!("request failed: {e}")
        })?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {status}");
        }

        if let Some(len) = response.content_length() {
            if len > target.max_bytes {
                bail!("response too large ({len} bytes, limit is {} bytes)", target.max_bytes);
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();

        // Chunked replies carry no length; stop reading once past the limit.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| anyhow!("error reading response: {e}"))?
        {
            if (body.len() + chunk.len()) as u64 > target.max_bytes {
                bail!("response too large (more than {} bytes)", target.max_bytes);
            }
            body.extend_from_slice(&chunk);
        }

        let text = extract_text(&content_type, &body)?;
        Ok(format_result(url, text.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TrustContext;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_context() -> ToolContext {
        ToolContext {
            turn: None,
            sandbox_id: 0,
            trust: TrustContext::Normal,
            reserved: Usage::default(),
        }
    }

    /// Tool whose client ignores proxy settings from the environment.
    fn local_tool() -> NetFetchTool {
        NetFetchTool {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    /// Serves one request with a chunked `text/plain` body made of `chunks`
    /// chunks of `chunk_size` bytes, then returns the server address.
    async fn chunked_server(chunk_size: usize, chunks: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\
                        Transfer-Encoding: chunked\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let chunk = format!("{chunk_size:x}\r\n{}\r\n", "a".repeat(chunk_size));
            for _ in 0..chunks {
                // The client hangs up once it has seen enough.
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}/")
    }

    // ── Trait method tests ──────────────────────────────

    #[test]
    fn test_name() {
        assert_eq!(NetFetchTool::new().name(), "net.fetch");
    }

    #[test]
    fn test_parameters_schema_has_url() {
        let schema = NetFetchTool::new().parameters_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["url"]["type"], "string");
        assert!(schema["required"].as_array().unwrap().contains(&json!("url")));
    }

    // ── Meta ────────────────────────────────────────────

    #[test]
    fn test_meta_scope_uses_default_port() {
        let meta = NetFetchTool::new()
            .meta(&json!({"url": "https://api.example.com/v1/items"}))
            .unwrap();
        assert_eq!(
            meta.required_caps,
            vec![CapRequirement::new("net", "get", "api.example.com:443")]
        );
        assert_eq!(meta.usage.net_calls, 1);
        assert_eq!(meta.usage.net_bytes, MAX_RESPONSE_SIZE);
    }

    #[test]
    fn test_meta_scope_explicit_port_and_max_bytes() {
        let meta = NetFetchTool::new()
            .meta(&json!({"url": "http://localhost:8080/", "max_bytes": 1024}))
            .unwrap();
        assert_eq!(meta.required_caps[0].scope, "localhost:8080");
        assert_eq!(meta.usage.net_bytes, 1024);
    }

    #[test]
    fn test_meta_max_bytes_clamped() {
        let meta = NetFetchTool::new()
            .meta(&json!({"url": "http://a.test/", "max_bytes": MAX_RESPONSE_SIZE * 10}))
            .unwrap();
        assert_eq!(meta.usage.net_bytes, MAX_RESPONSE_SIZE);
    }

    #[test]
    fn test_meta_rejects_zero_max_bytes() {
        assert!(NetFetchTool::new()
            .meta(&json!({"url": "http://a.test/", "max_bytes": 0}))
            .is_err());
    }

    // ── Parameter validation tests ──────────────────────

    #[tokio::test]
    async fn test_execute_missing_url_param() {
        let result = NetFetchTool::new().execute(json!({}), &test_context()).await;
        assert!(result.unwrap_err().to_string().contains("url"));
    }

    #[tokio::test]
    async fn test_execute_invalid_url() {
        let err = NetFetchTool::new()
            .execute(json!({"url": "not-a-url"}), &test_context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid URL"));
    }

    #[tokio::test]
    async fn test_execute_unsupported_scheme() {
        for url in ["ftp://example.com/file", "file:///etc/passwd", "data:text/html,<h1>hi</h1>"] {
            let err = NetFetchTool::new()
                .execute(json!({"url": url}), &test_context())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("unsupported scheme"), "{url}");
        }
    }

    #[tokio::test]
    async fn test_execute_small_chunked_body() {
        let url = chunked_server(5, 2).await;
        let text = local_tool()
            .execute(json!({"url": url, "max_bytes": 1024}), &test_context())
            .await
            .unwrap();
        assert!(text.contains("aaaaaaaaaa"));
    }

    #[tokio::test]
    async fn test_execute_chunked_body_stops_at_max_bytes() {
        // 64 KiB with no Content-Length against a 1 KiB ceiling.
        let url = chunked_server(1024, 64).await;
        let err = local_tool()
            .execute(json!({"url": url, "max_bytes": 1024}), &test_context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than 1024 bytes"));
    }

    #[tokio::test]
    async fn test_execute_url_param_wrong_type() {
        let result = NetFetchTool::new()
            .execute(json!({"url": 42}), &test_context())
            .await;
        assert!(result.is_err());
    }

    // ── format_result tests ─────────────────────────────

    #[test]
    fn test_format_result_normal() {
        let result = format_result("https://example.com", "Hello world");
        assert!(result.starts_with("Content from: https://example.com\n\n"));
        assert!(result.contains("Hello world"));
        assert!(!result.contains("truncated"));
    }

    #[test]
    fn test_format_result_empty_content() {
        let result = format_result("https://example.com", "");
        assert!(result.contains("[No text content extracted]"));
    }

    #[test]
    fn test_format_result_exact_limit() {
        let text = "a".repeat(MAX_TEXT_OUTPUT);
        assert!(!format_result("https://example.com", &text).contains("truncated"));
    }

    #[test]
    fn test_format_result_unicode_truncation() {
        let text = "é".repeat(MAX_TEXT_OUTPUT + 10);
        let result = format_result("https://example.com", &text);
        assert!(result.contains("[Content truncated"));
    }

    // ── extract_text tests ──────────────────────────────

    #[test]
    fn test_extract_text_html() {
        let html = b"<html><body><h1>Title</h1><p>Paragraph text.</p></body></html>";
        let text = extract_text("text/html; charset=utf-8", html).unwrap();
        assert!(text.contains("Title"));
        assert!(text.contains("Paragraph text."));
    }

    #[test]
    fn test_extract_text_plain() {
        let text = extract_text("text/plain", b"Just plain text content").unwrap();
        assert_eq!(text, "Just plain text content");
    }

    #[test]
    fn test_extract_text_binary_fails() {
        let err = extract_text("application/octet-stream", b"\x00\x01\x02binary").unwrap_err();
        assert!(err.to_string().contains("binary"));
    }

    #[test]
    fn test_is_html_and_is_text() {
        assert!(is_html("TEXT/HTML"));
        assert!(is_html("application/xhtml+xml"));
        assert!(!is_html("application/json"));
        assert!(is_text("application/json"));
        assert!(!is_text("image/png"));
    }
}
