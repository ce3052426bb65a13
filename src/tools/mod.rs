pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::TurnContext;
use crate::policy::{ToolMeta, TrustContext, Usage};

/// Runtime context passed to tool execution.
///
/// Built by the interpreter for every call. Tools that need to know which
/// turn they run in (token minting) read it from here and nowhere else.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Bound turn, `None` when called outside the host loop.
    pub turn: Option<TurnContext>,
    /// Id of the calling interpreter (0 is the root).
    pub sandbox_id: u64,
    /// Trust context of the policy the call was admitted under.
    pub trust: TrustContext,
    /// Usage the gate admitted and charged for this call. Tools that cannot
    /// know their real consumption up front stop at this reservation.
    pub reserved: Usage,
}

/// A tool that agent-written actions can invoke with `call`.
///
/// The interpreter asks for [`Tool::meta`] first, runs the result through
/// the policy gate, and only then calls [`Tool::execute`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Fully-qualified name, dotted lowercase (e.g. "fs.read").
    fn name(&self) -> &str;

    /// Human-readable description, listed in the agent's system prompt.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this tool accepts.
    fn parameters_schema(&self) -> Value;

    /// Trusted tools only run under the config context.
    fn requires_trust(&self) -> bool {
        false
    }

    /// Capabilities and resource usage of one invocation with `params`.
    ///
    /// Must not perform the effect itself. Fails on parameters the tool
    /// would reject anyway, before anything is reserved.
    fn meta(&self, _params: &Value) -> anyhow::Result<ToolMeta> {
        Ok(ToolMeta {
            requires_trust: self.requires_trust(),
            ..ToolMeta::new(self.name())
        })
    }

    /// Execute the tool and return a text result.
    ///
    /// Failures that are host errors (see [`crate::Error`]) propagate as-is;
    /// anything else is reported as a tool failure.
    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String>;
}

/// Reads a required string parameter.
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

pub use registry::{ToolDefinition, ToolRegistry};
