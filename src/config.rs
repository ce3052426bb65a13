use std::collections::{HashMap, HashSet};

use anyhow::bail;
use serde::Deserialize;

use crate::catalog::{Account, AgentModel};
use crate::host::{EnvelopeRecovery, LoopOptions};
use crate::policy::{Capability, Cost, ExecPolicy, GrantSet, Limits, TrustContext};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default, rename = "loop")]
    pub host_loop: LoopConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub accounts: HashMap<String, Account>,
    #[serde(default)]
    pub agents: Vec<AgentModel>,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Per-tool price, keyed by fully-qualified tool name.
    #[serde(default)]
    pub pricing: HashMap<String, Cost>,
    /// Procedures callable from actions with `run <name>`.
    #[serde(default)]
    pub procedures: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoopConfig {
    /// Upper bound for any agent's `max_turns`
    #[serde(default = "default_hard_cap")]
    pub hard_cap: u32,
    /// Identical turn digests in a row that halt the loop
    #[serde(default = "default_progress_window")]
    pub progress_window: usize,
    #[serde(default)]
    pub envelope_recovery: EnvelopeRecovery,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_clone_history")]
    pub clone_history: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            hard_cap: default_hard_cap(),
            progress_window: default_progress_window(),
            envelope_recovery: EnvelopeRecovery::default(),
            token_ttl_secs: default_token_ttl_secs(),
            replay_capacity: default_replay_capacity(),
            clone_history: default_clone_history(),
        }
    }
}

impl LoopConfig {
    pub fn options(&self) -> LoopOptions {
        LoopOptions {
            hard_cap: self.hard_cap,
            progress_window: self.progress_window,
            envelope_recovery: self.envelope_recovery,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Ollama,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// API base URL. Defaults per kind.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub context: TrustContext,
    /// Tool name patterns that may be called. Empty allows nothing.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Tool name patterns that may never be called.
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub grants: Vec<Capability>,
    #[serde(default)]
    pub limits: Limits,
}

impl PolicyConfig {
    pub fn build(&self) -> ExecPolicy {
        ExecPolicy::new(
            self.context,
            self.allow.clone(),
            self.deny.clone(),
            GrantSet::new(self.grants.clone(), self.limits.clone()),
        )
    }
}

fn default_hard_cap() -> u32 {
    32
}

fn default_progress_window() -> usize {
    3
}

fn default_token_ttl_secs() -> u64 {
    120
}

fn default_replay_capacity() -> usize {
    crate::token::replay::DEFAULT_REPLAY_CAPACITY
}

fn default_clone_history() -> usize {
    crate::sandbox::DEFAULT_CLONE_HISTORY
}

fn default_max_tokens() -> u32 {
    crate::llm::DEFAULT_MAX_TOKENS
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML, then expands environment variables like
    /// ${ANTHROPIC_API_KEY} in account keys and provider hosts.
    ///
    /// Procedures are left alone: `$name` there is a variable reference.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        for account in config.accounts.values_mut() {
            account.api_key = shellexpand::env(&account.api_key)?.into_owned();
        }
        for provider in config.providers.values_mut() {
            if let Some(host) = provider.host.as_mut() {
                *host = shellexpand::env(host.as_str())?.into_owned();
            }
        }
        Ok(config)
    }

    /// Checks cross-references between sections.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_loop.hard_cap == 0 {
            bail!("[loop] hard_cap must be at least 1");
        }
        if self.host_loop.progress_window < 2 {
            bail!("[loop] progress_window must be at least 2");
        }
        if self.host_loop.token_ttl_secs == 0 {
            bail!("[loop] token_ttl_secs must be at least 1");
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                bail!("agent '{}' is defined twice", agent.name);
            }
            if agent.max_turns == 0 {
                bail!("agent '{}': max_turns must be at least 1", agent.name);
            }
            if !self.providers.contains_key(&agent.provider) {
                bail!(
                    "agent '{}': unknown provider '{}'",
                    agent.name,
                    agent.provider
                );
            }
            if !agent.account.is_empty() && !self.accounts.contains_key(&agent.account) {
                bail!("agent '{}': unknown account '{}'", agent.name, agent.account);
            }
        }

        for (tool, cost) in &self.pricing {
            if cost.center.is_empty() {
                bail!("[pricing.\"{tool}\"] needs a cost center");
            }
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentModel> {
        self.agents.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [loop]
        hard_cap = 8
        progress_window = 4
        envelope_recovery = "diagnostic"

        [providers.anthropic]
        kind = "anthropic"
        max_tokens_per_request = 2048

        [providers.local]
        kind = "ollama"
        host = "http://localhost:11434"

        [accounts.main]
        api_key = "sk-test"

        [[agents]]
        name = "helper"
        provider = "anthropic"
        model = "claude-sonnet-4-5-20250929"
        account = "main"
        max_turns = 4
        tool_loop_permitted = true

        [[agents]]
        name = "local"
        provider = "local"
        model = "llama3.2"

        [policy]
        context = "normal"
        allow = ["control.*", "fs.*"]
        deny = ["fs.write"]

        [[policy.grants]]
        resource = "fs"
        verbs = ["read"]
        scopes = ["/tmp/*"]

        [policy.limits]
        net_max_calls = 10
        tool_max_calls = { "fs.read" = 20 }
        budget_per_run_cents = { web = 50 }

        [pricing."net.fetch"]
        center = "web"
        cents = 1

        [procedures]
        sign_off = "emit $farewell"
    "#;

    // ── Parsing ─────────────────────────────────────────

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.host_loop.hard_cap, 8);
        assert_eq!(config.host_loop.progress_window, 4);
        assert_eq!(config.host_loop.envelope_recovery, EnvelopeRecovery::Diagnostic);
        assert_eq!(config.host_loop.token_ttl_secs, 120);
        assert_eq!(config.providers["anthropic"].max_tokens_per_request, 2048);
        assert_eq!(config.providers["local"].kind, ProviderKind::Ollama);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agent("local").unwrap().max_turns, 1);
        assert_eq!(config.policy.grants[0].scopes, vec!["/tmp/*"]);
        assert_eq!(config.policy.limits.tool_max_calls["fs.read"], 20);
        assert_eq!(config.policy.limits.net_max_bytes, None);
        assert_eq!(config.pricing["net.fetch"].cents, 1);
        assert_eq!(config.procedures["sign_off"], "emit $farewell");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.host_loop.hard_cap, 32);
        assert_eq!(config.host_loop.progress_window, 3);
        assert_eq!(config.host_loop.envelope_recovery, EnvelopeRecovery::Strict);
        assert_eq!(config.policy.context, TrustContext::Normal);
        assert!(config.policy.allow.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("TURNWARD_TEST_KEY", "sk-from-env");
        let config = Config::parse(
            r#"
            [accounts.main]
            api_key = "${TURNWARD_TEST_KEY}"
            "#,
        )
        .unwrap();
        assert_eq!(config.accounts["main"].api_key, "sk-from-env");
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let result = Config::parse(
            r#"
            [accounts.main]
            api_key = "${TURNWARD_TEST_UNSET_VARIABLE}"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turnward.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.agents[0].name, "helper");
    }

    #[test]
    fn test_example_config_is_valid() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-example");
        let config = Config::parse(include_str!("../config/turnward.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.host_loop.clone_history, 256);
        assert_eq!(config.policy.grants.len(), 2);
    }

    #[test]
    fn test_unknown_recovery_mode_rejected() {
        assert!(Config::parse("[loop]\nenvelope_recovery = \"lenient\"").is_err());
    }

    // ── Validation ──────────────────────────────────────

    fn with_agent(agent: &str) -> Config {
        Config::parse(&format!(
            r#"
            [providers.anthropic]
            kind = "anthropic"

            [[agents]]
            {agent}
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_unknown_provider() {
        let config = with_agent("name = \"a\"\nprovider = \"nope\"\nmodel = \"m\"");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_validate_unknown_account() {
        let config =
            with_agent("name = \"a\"\nprovider = \"anthropic\"\nmodel = \"m\"\naccount = \"gone\"");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown account"));
    }

    #[test]
    fn test_validate_zero_turns() {
        let config =
            with_agent("name = \"a\"\nprovider = \"anthropic\"\nmodel = \"m\"\nmax_turns = 0");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_agent() {
        let mut config = with_agent("name = \"a\"\nprovider = \"anthropic\"\nmodel = \"m\"");
        config.agents.push(config.agents[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn test_validate_loop_bounds() {
        let mut config = Config::default();
        config.host_loop.progress_window = 1;
        assert!(config.validate().is_err());
        config.host_loop.progress_window = 3;
        config.host_loop.hard_cap = 0;
        assert!(config.validate().is_err());
    }

    // ── Policy ──────────────────────────────────────────

    #[test]
    fn test_policy_build() {
        let config = Config::parse(FULL).unwrap();
        let policy = config.policy.build();
        assert_eq!(policy.context(), TrustContext::Normal);
        assert_eq!(policy.grants().capabilities().len(), 1);
        assert_eq!(policy.grants().limits().net_max_calls, Some(10));
    }
}
