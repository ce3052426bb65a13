//! Builtin tool: mint a control token for the current turn.
//!
//! This is the only way an agent can produce a turn terminator. The token
//! is returned as the call's result; the agent emits it as the last line
//! of its output.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Error;
use crate::token::{ControlPayload, MagicTokens, TokenError};
use crate::tools::{Tool, ToolContext};

pub const MAGIC_TOKEN_TOOL: &str = "control.magic_token";

pub struct MagicTokenTool {
    tokens: Arc<MagicTokens>,
}

impl MagicTokenTool {
    pub fn new(tokens: Arc<MagicTokens>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Tool for MagicTokenTool {
    fn name(&self) -> &str {
        MAGIC_TOKEN_TOOL
    }

    fn description(&self) -> &str {
        "Mint a signed control token for the current turn. Emit the returned token \
         as the last line of your output to tell the host what to do next: \
         'continue' asks for another turn, 'done' finishes, 'abort' gives up."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": {
                    "type": "string",
                    "description": "Token kind; the host loop accepts \"loop\""
                },
                "params": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["continue", "done", "abort"]},
                        "request": {"description": "Optional data for the next turn"},
                        "telemetry": {"description": "Optional diagnostics for the host"}
                    },
                    "required": ["action"]
                }
            },
            "required": ["kind", "params"]
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let Some(turn) = context.turn.as_ref() else {
            return Err(Error::Internal(TokenError::MissingTurnContext.to_string()).into());
        };

        let kind = match params.get("kind") {
            None | Some(Value::Null) => return Err(TokenError::MissingKey("kind").into()),
            Some(Value::String(s)) => s.as_str(),
            Some(_) => {
                return Err(TokenError::WrongType {
                    key: "kind",
                    expected: "string",
                }
                .into())
            }
        };
        let payload = match params.get("params") {
            None | Some(Value::Null) => return Err(TokenError::MissingKey("params").into()),
            Some(p) => ControlPayload::from_params(p)?,
        };

        let token = self.tokens.mint(kind, &payload, turn)?;
        debug!("Minted {kind} token ({:?}) for {turn}", payload.action);
        Ok(token)
    }
}
