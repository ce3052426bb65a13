//! Tool registry: the catalog of callable tools, with per-tool pricing.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::Tool;
use crate::policy::{Cost, ToolMeta};

/// Description of a tool as shown to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    pricing: HashMap<String, Cost>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        if let Some(pos) = self.tools.iter().position(|t| t.name() == name) {
            warn!("Tool '{name}' registered twice, replacing");
            self.tools[pos] = tool;
        } else {
            debug!("Registered tool '{name}'");
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect()
    }

    /// Charges `cost` against every call of `tool`.
    pub fn set_price(&mut self, tool: &str, cost: Cost) {
        self.pricing.insert(tool.to_string(), cost);
    }

    pub fn price(&self, tool: &str) -> Option<&Cost> {
        self.pricing.get(tool)
    }

    /// Gate input for calling `tool` with `params`.
    ///
    /// The name and trust flag always come from the tool itself; a
    /// configured price applies unless the tool declared its own cost.
    pub fn invocation_meta(&self, tool: &dyn Tool, params: &Value) -> anyhow::Result<ToolMeta> {
        let mut meta = tool.meta(params)?;
        meta.name = tool.name().to_string();
        meta.requires_trust |= tool.requires_trust();
        if meta.usage.cost.is_none() {
            meta.usage.cost = self.pricing.get(tool.name()).cloned();
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo {
        name: &'static str,
        trusted: bool,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Echo the input"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        fn requires_trust(&self) -> bool {
            self.trusted
        }

        fn meta(&self, _params: &Value) -> anyhow::Result<ToolMeta> {
            // Lies about its name and trust; the registry must not believe it.
            Ok(ToolMeta::new("something.else"))
        }

        async fn execute(&self, params: Value, _context: &ToolContext) -> anyhow::Result<String> {
            Ok(params["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo { name: "util.echo", trusted: false }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("util.echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo { name: "util.echo", trusted: false }));
        registry.register(Box::new(Echo { name: "util.echo", trusted: true }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("util.echo").unwrap().requires_trust());
    }

    #[test]
    fn test_tool_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo { name: "util.echo", trusted: false }));
        let defs = registry.tool_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "util.echo");
        assert_eq!(defs[0].input_schema["type"], "object");
    }

    #[test]
    fn test_invocation_meta_uses_tool_identity() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo { name: "admin.echo", trusted: true }));
        let tool = registry.get("admin.echo").unwrap();
        let meta = registry.invocation_meta(tool, &json!({})).unwrap();
        assert_eq!(meta.name, "admin.echo");
        assert!(meta.requires_trust);
    }

    #[test]
    fn test_invocation_meta_applies_price() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo { name: "util.echo", trusted: false }));
        registry.set_price(
            "util.echo",
            Cost {
                center: "search".to_string(),
                cents: 3,
            },
        );
        let tool = registry.get("util.echo").unwrap();
        let meta = registry.invocation_meta(tool, &json!({})).unwrap();
        assert_eq!(meta.usage.cost.unwrap().cents, 3);
    }
}
