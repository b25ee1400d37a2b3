//! Routing across providers and credentials
//!
//! Exercises the router together with the credential pool over SQLite:
//! - Fallback to the other provider when one is exhausted
//! - Cooldown bookkeeping for language-bound credentials
//! - Credentials bound to another language are never used

use anyhow::Result;
use librelaycast::credentials::CredentialPool;
use librelaycast::db::Database;
use librelaycast::error::{ProviderFailure, RelayError, TranslationError};
use librelaycast::providers::mock::MockProvider;
use librelaycast::providers::ProviderRegistry;
use librelaycast::translation::TranslationRouter;
use librelaycast::types::{CredentialStatus, Language, NewCredential, Provider, TranslationJob};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEEPL_COOLDOWN: Duration = Duration::from_secs(10 * 24 * 3600);
const MISTRAL_COOLDOWN: Duration = Duration::from_secs(3600);

struct Setup {
    _temp_dir: TempDir,
    pool: CredentialPool,
    router: TranslationRouter,
    deepl: MockProvider,
    mistral: MockProvider,
}

async fn setup() -> Result<Setup> {
    let temp_dir = TempDir::new()?;
    let db = Database::new(&temp_dir.path().join("routing.db").to_string_lossy()).await?;
    let pool = CredentialPool::new(db);

    let deepl = MockProvider::new(Provider::DeepL).with_cooldown(DEEPL_COOLDOWN);
    let mistral = MockProvider::new(Provider::Mistral).with_cooldown(MISTRAL_COOLDOWN);
    let providers = ProviderRegistry::new()
        .with(Arc::new(deepl.clone()))
        .with(Arc::new(mistral.clone()));

    let router = TranslationRouter::new(
        pool.clone(),
        providers,
        Language::new("Russian", "RU"),
        Duration::from_secs(5),
    );

    Ok(Setup {
        _temp_dir: temp_dir,
        pool,
        router,
        deepl,
        mistral,
    })
}

fn czech() -> Language {
    Language::new("Czech", "CS")
}

fn job(text: &str, preferred: Provider) -> TranslationJob {
    TranslationJob {
        text: text.to_string(),
        target: czech(),
        preferred,
    }
}

#[tokio::test]
async fn test_falls_back_when_preferred_provider_is_exhausted() -> Result<()> {
    let s = setup().await?;
    let first = s.pool.add(&NewCredential::deepl("deepl-a")).await?;
    let second = s.pool.add(&NewCredential::deepl("deepl-b")).await?;
    s.pool.mark_exhausted(&first, DEEPL_COOLDOWN).await?;
    s.pool.mark_exhausted(&second, DEEPL_COOLDOWN).await?;
    s.pool
        .add(&NewCredential::mistral("mistral-cz", "ag:cz", "Czech"))
        .await?;

    let text = s.router.translate(&job("Ahoj", Provider::DeepL)).await?;

    assert_eq!(text, "[CS] Ahoj");
    assert!(s.deepl.calls().is_empty(), "excluded credentials must not be called");
    assert_eq!(s.mistral.called_keys(), vec!["mistral-cz".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_rate_limited_language_credential_skipped_during_cooldown() -> Result<()> {
    let s = setup().await?;
    let czech_key = s
        .pool
        .add(&NewCredential::mistral("mistral-cz", "ag:cz", "Czech"))
        .await?;
    s.pool.add(&NewCredential::deepl("deepl-a")).await?;
    s.mistral.fail_key(
        "mistral-cz",
        ProviderFailure::RateLimited("429 Too Many Requests".to_string()),
    );

    let before = chrono::Utc::now().timestamp();
    let text = s.router.translate(&job("Zprava", Provider::Mistral)).await?;
    assert_eq!(text, "[CS] Zprava");

    let stored = s
        .pool
        .list(Provider::Mistral)
        .await?
        .into_iter()
        .find(|c| c.id == czech_key.id)
        .unwrap();
    assert_eq!(stored.status, CredentialStatus::Cooling);
    let until = stored.cooldown_until.unwrap();
    assert!(until >= before + MISTRAL_COOLDOWN.as_secs() as i64);
    assert!(until < before + DEEPL_COOLDOWN.as_secs() as i64);

    // Within the window the next call goes straight to DeepL
    s.router.translate(&job("Dalsi", Provider::Mistral)).await?;
    assert_eq!(s.mistral.calls().len(), 1);
    assert_eq!(s.deepl.calls().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_credential_for_other_language_never_used() -> Result<()> {
    let s = setup().await?;
    s.pool
        .add(&NewCredential::mistral("mistral-de", "ag:de", "German"))
        .await?;

    let result = s.router.translate(&job("Text", Provider::Mistral)).await;

    assert!(s.mistral.calls().is_empty());
    match result {
        Err(RelayError::Translation(TranslationError::AllProvidersExhausted { attempts })) => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].provider, Provider::Mistral);
            assert_eq!(attempts[0].error, "no eligible credentials");
            assert_eq!(attempts[1].provider, Provider::DeepL);
        }
        other => panic!("Expected AllProvidersExhausted, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_jobs_leave_consistent_cooldown() -> Result<()> {
    let s = setup().await?;
    s.pool.add(&NewCredential::deepl("shared-key")).await?;
    s.deepl
        .fail_key("shared-key", ProviderFailure::RateLimited("456".to_string()));

    let jobs: Vec<_> = (0..8)
        .map(|i| {
            let router = s.router.clone();
            tokio::spawn(async move { router.translate(&job(&format!("t{}", i), Provider::DeepL)).await })
        })
        .collect();
    for handle in jobs {
        assert!(handle.await?.is_err());
    }

    let stored = s.pool.list(Provider::DeepL).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, CredentialStatus::Cooling);
    assert!(stored[0].cooldown_until.is_some());
    Ok(())
}
