//! Builtin tool: register an agent model. Trusted.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::catalog::{AgentCatalog, AgentModel};
use crate::policy::{CapRequirement, ToolMeta};
use crate::tools::{required_str, Tool, ToolContext};

pub struct RegisterAgentTool {
    catalog: Arc<AgentCatalog>,
}

impl RegisterAgentTool {
    pub fn new(catalog: Arc<AgentCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for RegisterAgentTool {
    fn name(&self) -> &str {
        "agent.register"
    }

    fn description(&self) -> &str {
        "Register or replace an agent model. Only available at configuration time."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "provider": {"type": "string"},
                "model": {"type": "string"},
                "account": {"type": "string"},
                "max_turns": {"type": "integer", "minimum": 1},
                "tool_loop_permitted": {"type": "boolean"}
            },
            "required": ["name", "provider", "model"]
        })
    }

    fn requires_trust(&self) -> bool {
        true
    }

    fn meta(&self, params: &Value) -> anyhow::Result<ToolMeta> {
        let name = required_str(params, "name")?;
        Ok(ToolMeta {
            requires_trust: true,
            required_caps: vec![CapRequirement::new("agents", "write", name)],
            ..ToolMeta::new(self.name())
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let model: AgentModel =
            serde_json::from_value(params).map_err(|e| anyhow!("invalid agent model: {e}"))?;
        if model.max_turns == 0 {
            return Err(anyhow!("max_turns must be at least 1"));
        }
        let name = model.name.clone();
        self.catalog.register(context.trust, model)?;
        Ok(format!("Registered agent '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::policy::{TrustContext, Usage};

    fn ctx(trust: TrustContext) -> ToolContext {
        ToolContext {
            turn: None,
            sandbox_id: 0,
            trust,
            reserved: Usage::default(),
        }
    }

    #[test]
    fn test_meta_is_trusted_and_scoped_by_name() {
        let tool = RegisterAgentTool::new(Arc::new(AgentCatalog::new()));
        let meta = tool
            .meta(&json!({"name": "helper", "provider": "p", "model": "m"}))
            .unwrap();
        assert!(meta.requires_trust);
        assert_eq!(meta.required_caps, vec![CapRequirement::new("agents", "write", "helper")]);
    }

    #[tokio::test]
    async fn test_registers_in_config_context() {
        let catalog = Arc::new(AgentCatalog::new());
        let tool = RegisterAgentTool::new(Arc::clone(&catalog));
        tool.execute(
            json!({"name": "helper", "provider": "local", "model": "llama3", "max_turns": 4}),
            &ctx(TrustContext::Config),
        )
        .await
        .unwrap();
        let model = catalog.get("helper").unwrap();
        assert_eq!(model.max_turns, 4);
        assert!(!model.tool_loop_permitted);
    }

    #[tokio::test]
    async fn test_catalog_rejects_untrusted_context() {
        let catalog = Arc::new(AgentCatalog::new());
        let tool = RegisterAgentTool::new(Arc::clone(&catalog));
        let err = tool
            .execute(
                json!({"name": "helper", "provider": "local", "model": "llama3"}),
                &ctx(TrustContext::Normal),
            )
            .await
            .unwrap_err();
        let err = err.downcast::<Error>().unwrap();
        assert_eq!(err.kind(), ErrorKind::TrustViolation);
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_zero_turns_rejected() {
        let tool = RegisterAgentTool::new(Arc::new(AgentCatalog::new()));
        let result = tool
            .execute(
                json!({"name": "a", "provider": "p", "model": "m", "max_turns": 0}),
                &ctx(TrustContext::Config),
            )
            .await;
        assert!(result.is_err());
    }
}
