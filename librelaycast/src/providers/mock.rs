//! Mock translation provider for testing
//!
//! Translates by prefixing the target code (`"[CS] text"`) and can be told
//! to fail for particular keys or languages. Every call is recorded so tests
//! can check which credentials the router actually touched.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::ProviderFailure;
use crate::providers::TranslationProvider;
use crate::types::{Credential, Language, Provider};

/// One recorded translate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub api_key: String,
    pub text: String,
    pub language: String,
}

/// Cloning shares the recorded calls and scripted failures
#[derive(Clone)]
pub struct MockProvider {
    provider: Provider,
    cooldown: Duration,
    delay: Duration,
    translate_failures: Arc<Mutex<HashMap<String, ProviderFailure>>>,
    probe_failures: Arc<Mutex<HashMap<String, ProviderFailure>>>,
    unsupported: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    probes: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            cooldown: Duration::from_secs(3600),
            delay: Duration::ZERO,
            translate_failures: Arc::new(Mutex::new(HashMap::new())),
            probe_failures: Arc::new(Mutex::new(HashMap::new())),
            unsupported: Arc::new(Mutex::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Delay every translate call (simulates a slow provider)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make translate calls with this key fail
    pub fn fail_key(&self, api_key: &str, failure: ProviderFailure) {
        lock(&self.translate_failures).insert(api_key.to_string(), failure);
    }

    /// Make probes with this key fail
    pub fn fail_probe(&self, api_key: &str, failure: ProviderFailure) {
        lock(&self.probe_failures).insert(api_key.to_string(), failure);
    }

    /// Let a key succeed again, for both translate and probe
    pub fn heal_key(&self, api_key: &str) {
        lock(&self.translate_failures).remove(api_key);
        lock(&self.probe_failures).remove(api_key);
    }

    /// Reject a target language code outright
    pub fn unsupported_language(&self, code: &str) {
        lock(&self.unsupported).insert(code.to_uppercase());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn called_keys(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.api_key.clone()).collect()
    }

    pub fn probed_keys(&self) -> Vec<String> {
        lock(&self.probes).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TranslationProvider for MockProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn translate(
        &self,
        credential: &Credential,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, ProviderFailure> {
        lock(&self.calls).push(MockCall {
            api_key: credential.api_key.clone(),
            text: text.to_string(),
            language: language.name.clone(),
        });

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if lock(&self.unsupported).contains(&language.code.to_uppercase()) {
            return Err(ProviderFailure::Unsupported(format!(
                "{} not served",
                language.code
            )));
        }

        if let Some(failure) = lock(&self.translate_failures).get(&credential.api_key) {
            return Err(failure.clone());
        }

        Ok(format!("[{}] {}", language.code, text))
    }

    async fn probe(&self, credential: &Credential) -> std::result::Result<(), ProviderFailure> {
        lock(&self.probes).push(credential.api_key.clone());

        match lock(&self.probe_failures).get(&credential.api_key) {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}
