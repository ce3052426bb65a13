pub mod anthropic;
pub mod client;
pub mod ollama;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{ProviderConfig, ProviderKind};
pub use anthropic::AnthropicProvider;
pub use client::{AiRequest, AiResponse, Provider};
pub use ollama::OllamaProvider;

/// Default `max_tokens` for a provider entry.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// A configured provider.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider: Arc<dyn Provider>,
    pub max_tokens: u32,
}

/// Providers keyed by the id agent models refer to.
#[derive(Clone, Default)]
pub struct ProviderCatalog {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one client per `[providers.<id>]` section.
    pub fn from_config(providers: &HashMap<String, ProviderConfig>) -> Self {
        let mut catalog = Self::new();
        for (id, cfg) in providers {
            let provider: Arc<dyn Provider> = match cfg.kind {
                ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(cfg.host.clone())),
                ProviderKind::Ollama => Arc::new(OllamaProvider::new(cfg.host.clone())),
            };
            info!("Provider '{id}': {}", provider.description());
            catalog.insert(id, provider, cfg.max_tokens_per_request);
        }
        catalog
    }

    pub fn insert(&mut self, id: &str, provider: Arc<dyn Provider>, max_tokens: u32) {
        self.entries.insert(
            id.to_string(),
            ProviderEntry {
                provider,
                max_tokens,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
