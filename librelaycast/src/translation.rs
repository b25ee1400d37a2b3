//! Translation routing across providers and credentials
//!
//! For one job the router tries the preferred provider's eligible credentials
//! in insertion order, then the other provider's, feeding every failure back
//! into the credential pool:
//!
//! | failure        | credential         | next step              |
//! |----------------|--------------------|------------------------|
//! | `RateLimited`  | cooling (cooldown) | next credential        |
//! | `Unauthorized` | invalid            | next credential        |
//! | `Transient`    | unchanged          | next credential        |
//! | `Unsupported`  | unchanged          | next provider          |
//!
//! Nothing here is persisted besides those credential transitions.

use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::credentials::CredentialPool;
use crate::error::{ProviderAttempt, ProviderFailure, Result, TranslationError};
use crate::providers::ProviderRegistry;
use crate::types::{CredentialStatus, Language, Provider, TranslationJob};

/// What one provider produced for a job
enum ProviderOutcome {
    Translated(String),
    Failed(String),
}

#[derive(Clone)]
pub struct TranslationRouter {
    pool: CredentialPool,
    providers: ProviderRegistry,
    source_language: Language,
    call_timeout: Duration,
}

impl TranslationRouter {
    pub fn new(
        pool: CredentialPool,
        providers: ProviderRegistry,
        source_language: Language,
        call_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            providers,
            source_language,
            call_timeout,
        }
    }

    pub fn source_language(&self) -> &Language {
        &self.source_language
    }

    /// True when text for this language needs no translation
    pub fn is_source_language(&self, language: &Language) -> bool {
        language.same_as(&self.source_language)
    }

    /// Translate or fail naming each provider's last error
    pub async fn translate(&self, job: &TranslationJob) -> Result<String> {
        if self.is_source_language(&job.target) {
            return Ok(job.text.clone());
        }

        let mut attempts = Vec::with_capacity(2);
        for provider in [job.preferred, job.preferred.other()] {
            match self.attempt_provider(provider, job).await? {
                ProviderOutcome::Translated(text) => return Ok(text),
                ProviderOutcome::Failed(error) => {
                    debug!(provider = %provider, language = %job.target.name, %error, "Provider attempt failed");
                    attempts.push(ProviderAttempt { provider, error });
                }
            }
        }

        Err(TranslationError::AllProvidersExhausted { attempts }.into())
    }

    /// Never fails; returns the untranslated text with `false` when translation did not happen
    pub async fn translate_or_original(&self, job: &TranslationJob) -> (String, bool) {
        match self.translate(job).await {
            Ok(text) => (text, true),
            Err(e) => {
                warn!(language = %job.target.name, "Sending original text: {}", e);
                (job.text.clone(), false)
            }
        }
    }

    async fn attempt_provider(
        &self,
        provider: Provider,
        job: &TranslationJob,
    ) -> Result<ProviderOutcome> {
        let Some(adapter) = self.providers.get(provider) else {
            return Ok(ProviderOutcome::Failed("no adapter registered".to_string()));
        };

        let credentials = self.pool.list_eligible(provider, &job.target).await?;
        if credentials.is_empty() {
            return Ok(ProviderOutcome::Failed("no eligible credentials".to_string()));
        }

        let mut last_error = String::new();
        for credential in credentials {
            let call = adapter.translate(&credential, &job.text, &job.target);
            let result = match timeout(self.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderFailure::Transient(format!(
                    "timed out after {}s",
                    self.call_timeout.as_secs()
                ))),
            };

            match result {
                Ok(text) => {
                    if credential.status != CredentialStatus::Active {
                        self.pool.mark_healthy(&credential).await?;
                    }
                    info!(
                        provider = %provider,
                        credential_id = credential.id,
                        language = %job.target.name,
                        "Translated"
                    );
                    return Ok(ProviderOutcome::Translated(text));
                }
                Err(failure) => {
                    warn!(
                        provider = %provider,
                        credential_id = credential.id,
                        key = %credential.masked_key(),
                        language = %job.target.name,
                        "Translation failed: {}",
                        failure
                    );
                    last_error = failure.to_string();
                    match failure {
                        ProviderFailure::RateLimited(_) => {
                            self.pool
                                .mark_exhausted(&credential, adapter.cooldown())
                                .await?;
                        }
                        ProviderFailure::Unauthorized(_) => {
                            self.pool.mark_invalid(&credential).await?;
                        }
                        ProviderFailure::Transient(_) => {}
                        ProviderFailure::Unsupported(_) => break,
                    }
                }
            }
        }

        Ok(ProviderOutcome::Failed(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::RelayError;
    use crate::providers::mock::MockProvider;
    use crate::types::NewCredential;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        router: TranslationRouter,
        pool: CredentialPool,
        deepl: MockProvider,
        mistral: MockProvider,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("router.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let pool = CredentialPool::new(db);

        let deepl = MockProvider::new(Provider::DeepL).with_cooldown(Duration::from_secs(864_000));
        let mistral = MockProvider::new(Provider::Mistral);
        let registry = ProviderRegistry::new()
            .with(Arc::new(deepl.clone()))
            .with(Arc::new(mistral.clone()));

        let router = TranslationRouter::new(
            pool.clone(),
            registry,
            Language::new("Russian", "RU"),
            Duration::from_millis(200),
        );

        Fixture {
            router,
            pool,
            deepl,
            mistral,
            _temp_dir: temp_dir,
        }
    }

    fn job(text: &str, target: Language, preferred: Provider) -> TranslationJob {
        TranslationJob {
            text: text.to_string(),
            target,
            preferred,
        }
    }

    #[tokio::test]
    async fn test_source_language_is_returned_unchanged() {
        let f = fixture().await;
        let text = f
            .router
            .translate(&job("Привет", Language::new("Russian", "ru"), Provider::DeepL))
            .await
            .unwrap();

        assert_eq!(text, "Привет");
        assert!(f.deepl.calls().is_empty());
        assert!(f.mistral.calls().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_tried_in_insertion_order() {
        let f = fixture().await;
        f.pool.add(&NewCredential::deepl("first")).await.unwrap();
        f.pool.add(&NewCredential::deepl("second")).await.unwrap();
        f.deepl
            .fail_key("first", ProviderFailure::Transient("reset".to_string()));

        let text = f
            .router
            .translate(&job("hi", Language::new("Czech", "CS"), Provider::DeepL))
            .await
            .unwrap();

        assert_eq!(text, "[CS] hi");
        assert_eq!(f.deepl.called_keys(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_unauthorized_marks_invalid_and_continues() {
        let f = fixture().await;
        let bad = f.pool.add(&NewCredential::deepl("revoked")).await.unwrap();
        f.pool.add(&NewCredential::deepl("good")).await.unwrap();
        f.deepl
            .fail_key("revoked", ProviderFailure::Unauthorized("403".to_string()));

        f.router
            .translate(&job("hi", Language::new("Czech", "CS"), Provider::DeepL))
            .await
            .unwrap();

        let stored = f.pool.database().get_credential(bad.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Invalid);
    }

    #[tokio::test]
    async fn test_unsupported_skips_remaining_credentials() {
        let f = fixture().await;
        f.pool.add(&NewCredential::deepl("d1")).await.unwrap();
        f.pool.add(&NewCredential::deepl("d2")).await.unwrap();
        f.pool
            .add(&NewCredential::mistral("m1", "agent", "Armenian"))
            .await
            .unwrap();
        f.deepl.unsupported_language("HY");

        let text = f
            .router
            .translate(&job("hi", Language::new("Armenian", "HY"), Provider::DeepL))
            .await
            .unwrap();

        assert_eq!(text, "[HY] hi");
        assert_eq!(f.deepl.called_keys(), vec!["d1"]);
        assert_eq!(f.mistral.called_keys(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_as_transient() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("slow.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let pool = CredentialPool::new(db);
        let slow = MockProvider::new(Provider::DeepL).with_delay(Duration::from_secs(5));
        let router = TranslationRouter::new(
            pool.clone(),
            ProviderRegistry::new().with(Arc::new(slow)),
            Language::new("Russian", "RU"),
            Duration::from_millis(50),
        );
        let credential = pool.add(&NewCredential::deepl("slow")).await.unwrap();

        let result = router
            .translate(&job("hi", Language::new("Czech", "CS"), Provider::DeepL))
            .await;

        match result {
            Err(RelayError::Translation(TranslationError::AllProvidersExhausted { attempts })) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].error.contains("timed out"));
                assert_eq!(attempts[1].error, "no adapter registered");
            }
            other => panic!("Expected AllProvidersExhausted, got {:?}", other.map(|_| ())),
        }

        // Timeouts never change credential state
        let stored = pool.database().get_credential(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_translate_or_original_falls_back() {
        let f = fixture().await;
        let (text, ok) = f
            .router
            .translate_or_original(&job("hi", Language::new("Czech", "CS"), Provider::Mistral))
            .await;
        assert_eq!(text, "hi");
        assert!(!ok);
    }
}
