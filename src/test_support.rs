//! Fixtures shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::catalog::{AccountStore, AgentCatalog, AgentModel};
use crate::host::{HostLoop, LoopOptions};
use crate::llm::{AiRequest, AiResponse, Provider, ProviderCatalog};
use crate::policy::{ExecPolicy, TrustContext};
use crate::sandbox::{Interpreter, SharedCatalogs};
use crate::token::{MagicTokens, DEFAULT_TOKEN_TTL};
use crate::tools::builtin::register_builtins;
use crate::tools::{required_str, Tool, ToolContext, ToolRegistry};

/// Catalogs with the builtin tools registered and no accounts.
pub(crate) fn test_catalogs(policy: ExecPolicy) -> SharedCatalogs {
    let tokens = Arc::new(MagicTokens::generate(DEFAULT_TOKEN_TTL, 64));
    let agents = Arc::new(AgentCatalog::new());
    let mut tools = ToolRegistry::new();
    register_builtins(&mut tools, Arc::clone(&tokens), Arc::clone(&agents));
    SharedCatalogs {
        tools,
        accounts: AccountStore::new(HashMap::new()),
        agents,
        policy: Arc::new(policy),
        tokens,
    }
}

/// `test.echo`: returns `params.text`.
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "test.echo"
    }

    fn description(&self) -> &str {
        "Echo the text parameter"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    async fn execute(&self, params: Value, _context: &ToolContext) -> anyhow::Result<String> {
        Ok(required_str(&params, "text")?.to_string())
    }
}

/// `test.fail`: always fails.
pub(crate) struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "test.fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _params: Value, _context: &ToolContext) -> anyhow::Result<String> {
        anyhow::bail!("boom")
    }
}

/// Provider that replays canned replies and records what it was sent.
pub(crate) struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, String>>>,
    repeat: Option<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AiRequest>>,
}

impl ScriptedProvider {
    /// Replies in order; calls past the end fail.
    pub(crate) fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Gives the same reply to every call.
    pub(crate) fn repeating(reply: &str) -> Self {
        Self {
            repeat: Some(reply.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<AiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(&self, request: &AiRequest) -> anyhow::Result<AiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = match &self.repeat {
            Some(reply) => Ok(reply.clone()),
            None => self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("no scripted reply left".to_string())),
        };
        match next {
            Ok(text) => Ok(AiResponse {
                text_content: text,
                ..AiResponse::default()
            }),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

/// Provider whose calls never return; signals `started` when entered.
#[derive(Default)]
pub(crate) struct BlockingProvider {
    calls: AtomicUsize,
    pub(crate) started: Notify,
}

impl BlockingProvider {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for BlockingProvider {
    async fn chat(&self, _request: &AiRequest) -> anyhow::Result<AiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        std::future::pending().await
    }

    fn description(&self) -> String {
        "blocking".to_string()
    }
}

/// A provider reply whose ACTIONS block holds `body`.
pub(crate) fn reply(body: &str) -> String {
    format!("Sure.\n<<<ENVELOPE>>>\n<<<ACTIONS>>>\ncommand\n{body}\nendcommand\n<<<END>>>\n")
}

/// Statements minting a loop token with `action` and emitting it.
pub(crate) fn token_call(action: &str) -> String {
    format!(
        "call control.magic_token {{\"kind\":\"loop\",\"params\":{{\"action\":\"{action}\"}}}} -> token\nemit $token"
    )
}

/// Host loop whose agent `agent` talks to `provider` under provider id "scripted".
pub(crate) fn test_host(
    policy: ExecPolicy,
    agent: AgentModel,
    provider: &Arc<ScriptedProvider>,
    options: LoopOptions,
) -> HostLoop {
    let provider: Arc<dyn Provider> = provider.clone();
    test_host_with(policy, agent, provider, options)
}

/// [`test_host`] for any provider.
pub(crate) fn test_host_with(
    policy: ExecPolicy,
    agent: AgentModel,
    provider: Arc<dyn Provider>,
    options: LoopOptions,
) -> HostLoop {
    let mut catalogs = test_catalogs(policy);
    catalogs.tools.register(Box::new(EchoTool));
    catalogs.tools.register(Box::new(FailTool));
    catalogs
        .agents
        .register(TrustContext::Config, agent)
        .unwrap();
    let mut providers = ProviderCatalog::new();
    providers.insert("scripted", provider, 1024);
    HostLoop::new(Interpreter::new_root(catalogs), providers, options)
}
