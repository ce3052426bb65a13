//! Shared catalogs: registered agent models and provider accounts.
//!
//! Both are reachable from every sandbox clone. Agent models change only in
//! the config context; accounts are fixed once the runtime is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::policy::TrustContext;

/// Host-registered descriptor of an AI agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentModel {
    pub name: String,
    /// Provider id, a key of `[providers]`.
    pub provider: String,
    pub model: String,
    /// Account used for credential lookup, a key of `[accounts]`.
    #[serde(default)]
    pub account: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Whether the agent may ask for another turn.
    #[serde(default)]
    pub tool_loop_permitted: bool,
}

fn default_max_turns() -> u32 {
    1
}

impl AgentModel {
    pub fn new(name: &str, provider: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            account: String::new(),
            max_turns: default_max_turns(),
            tool_loop_permitted: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct AgentCatalog {
    models: RwLock<HashMap<String, AgentModel>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an agent model. Privileged.
    pub fn register(&self, context: TrustContext, model: AgentModel) -> Result<()> {
        Self::require_config(context, "agent registration")?;
        if model.name.trim().is_empty() {
            return Err(Error::Internal("agent model needs a name".to_string()));
        }
        let mut models = self
            .models
            .write()
            .map_err(|_| Error::Internal("agent catalog lock poisoned".to_string()))?;
        info!(
            "Registered agent '{}' ({} / {}, max_turns={}, loop={})",
            model.name, model.provider, model.model, model.max_turns, model.tool_loop_permitted
        );
        models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Removes an agent model. Privileged.
    pub fn remove(&self, context: TrustContext, name: &str) -> Result<Option<AgentModel>> {
        Self::require_config(context, "agent removal")?;
        let mut models = self
            .models
            .write()
            .map_err(|_| Error::Internal("agent catalog lock poisoned".to_string()))?;
        Ok(models.remove(name))
    }

    pub fn get(&self, name: &str) -> Option<AgentModel> {
        self.models.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require_config(context: TrustContext, what: &str) -> Result<()> {
        if context.permits_trusted() {
            Ok(())
        } else {
            Err(Error::TrustViolation {
                tool: what.to_string(),
                context: context.to_string(),
            })
        }
    }
}

/// Credentials for one provider account.
#[derive(Clone, Deserialize)]
pub struct Account {
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account").field("api_key", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
}

impl AccountStore {
    pub fn new(accounts: HashMap<String, Account>) -> Self {
        Self { accounts }
    }

    pub fn api_key(&self, account: &str) -> Option<&str> {
        self.accounts.get(account).map(|a| a.api_key.as_str())
    }

    pub fn contains(&self, account: &str) -> bool {
        self.accounts.contains_key(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_register_requires_config_context() {
        let catalog = AgentCatalog::new();
        let model = AgentModel::new("helper", "anthropic", "claude");
        for ctx in [TrustContext::Normal, TrustContext::Test] {
            let err = catalog.register(ctx, model.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TrustViolation);
        }
        assert!(catalog.is_empty());

        catalog.register(TrustContext::Config, model.clone()).unwrap();
        assert_eq!(catalog.get("helper"), Some(model));
    }

    #[test]
    fn test_register_replaces() {
        let catalog = AgentCatalog::new();
        let mut model = AgentModel::new("helper", "anthropic", "claude");
        catalog.register(TrustContext::Config, model.clone()).unwrap();
        model.max_turns = 5;
        catalog.register(TrustContext::Config, model).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("helper").unwrap().max_turns, 5);
    }

    #[test]
    fn test_remove_requires_config_context() {
        let catalog = AgentCatalog::new();
        catalog
            .register(TrustContext::Config, AgentModel::new("a", "p", "m"))
            .unwrap();
        assert!(catalog.remove(TrustContext::Normal, "a").is_err());
        assert!(catalog.get("a").is_some());
        assert!(catalog.remove(TrustContext::Config, "a").unwrap().is_some());
        assert!(catalog.get("a").is_none());
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let catalog = AgentCatalog::new();
        let err = catalog
            .register(TrustContext::Config, AgentModel::new(" ", "p", "m"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_names_sorted() {
        let catalog = AgentCatalog::new();
        for name in ["zeta", "alpha", "mid"] {
            catalog
                .register(TrustContext::Config, AgentModel::new(name, "p", "m"))
                .unwrap();
        }
        assert_eq!(catalog.names(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_agent_model_defaults_from_toml() {
        let model: AgentModel = toml::from_str(
            r#"
            name = "helper"
            provider = "anthropic"
            model = "claude-sonnet-4-5-20250929"
            "#,
        )
        .unwrap();
        assert_eq!(model.max_turns, 1);
        assert!(!model.tool_loop_permitted);
        assert_eq!(model.account, "");
    }

    #[test]
    fn test_account_debug_redacts_key() {
        let account = Account {
            api_key: "sk-secret".to_string(),
        };
        assert!(!format!("{account:?}").contains("sk-secret"));
        let store = AccountStore::new(HashMap::from([("main".to_string(), account)]));
        assert_eq!(store.api_key("main"), Some("sk-secret"));
        assert_eq!(store.api_key("other"), None);
    }
}
