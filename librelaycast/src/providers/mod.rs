//! Translation provider adapters
//!
//! Each adapter wraps one external translation API and classifies its own
//! failures into [`ProviderFailure`]. That classification is the only
//! provider-specific knowledge the router relies on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TranslationConfig;
use crate::error::{ProviderFailure, Result};
use crate::types::{Credential, Language, Provider};

pub mod deepl;
pub mod mistral;

// Mock provider is available for all builds (not just tests) to support integration tests
pub mod mock;

/// One external translation service
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Which provider this adapter speaks for
    fn provider(&self) -> Provider;

    /// How long a rate-limited credential is excluded
    fn cooldown(&self) -> Duration;

    /// Translate `text` into `language` using one credential
    async fn translate(
        &self,
        credential: &Credential,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, ProviderFailure>;

    /// Lightweight liveness check used by the health sweep
    async fn probe(&self, credential: &Credential) -> std::result::Result<(), ProviderFailure>;
}

/// The adapters available to the router and the health monitor
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn TranslationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same provider
    pub fn with(mut self, adapter: Arc<dyn TranslationProvider>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Build the real HTTP adapters from configuration
    pub fn from_config(config: &TranslationConfig) -> Result<Self> {
        let deepl = deepl::DeepLProvider::new(&config.deepl, config.request_timeout)?;
        let mistral = mistral::MistralProvider::new(&config.mistral, config.request_timeout)?;

        Ok(Self::new()
            .with(Arc::new(deepl))
            .with(Arc::new(mistral)))
    }

    pub fn get(&self, provider: Provider) -> Option<&Arc<dyn TranslationProvider>> {
        self.adapters.get(&provider)
    }
}

/// Truncate an error body so logs stay readable
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.trim().to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}...", cut.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::new(Provider::Mistral)));

        assert!(registry.get(Provider::Mistral).is_some());
        assert!(registry.get(Provider::DeepL).is_none());
    }

    #[test]
    fn test_registry_from_config_has_both_providers() {
        let registry = ProviderRegistry::from_config(&TranslationConfig::default()).unwrap();
        for provider in Provider::ALL {
            assert_eq!(registry.get(provider).unwrap().provider(), provider);
        }
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "x".repeat(500);
        assert_eq!(snippet(&long).len(), 203);
        assert_eq!(snippet("  short  "), "short");
    }
}
