//! Health sweeps interacting with live routing
//!
//! Credentials taken out by live traffic come back through the sweep, and
//! credentials a provider rejected are purged by it.

use anyhow::Result;
use librelaycast::credentials::CredentialPool;
use librelaycast::db::Database;
use librelaycast::error::ProviderFailure;
use librelaycast::health::HealthMonitor;
use librelaycast::providers::mock::MockProvider;
use librelaycast::providers::ProviderRegistry;
use librelaycast::translation::TranslationRouter;
use librelaycast::types::{CredentialStatus, Language, NewCredential, Provider, TranslationJob};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn setup() -> Result<(TempDir, CredentialPool, TranslationRouter, HealthMonitor, MockProvider)> {
    let temp_dir = TempDir::new()?;
    let db = Database::new(&temp_dir.path().join("health.db").to_string_lossy()).await?;
    let pool = CredentialPool::new(db);

    let mistral = MockProvider::new(Provider::Mistral).with_cooldown(Duration::from_secs(60));
    let providers = ProviderRegistry::new()
        .with(Arc::new(MockProvider::new(Provider::DeepL)))
        .with(Arc::new(mistral.clone()));

    let router = TranslationRouter::new(
        pool.clone(),
        providers.clone(),
        Language::new("Russian", "RU"),
        Duration::from_secs(5),
    );
    let monitor = HealthMonitor::new(pool.clone(), providers, Duration::from_secs(5));
    Ok((temp_dir, pool, router, monitor, mistral))
}

fn czech_job() -> TranslationJob {
    TranslationJob {
        text: "Ahoj".to_string(),
        target: Language::new("Czech", "CS"),
        preferred: Provider::Mistral,
    }
}

#[tokio::test]
async fn test_exhausted_credential_recovers_through_sweep() -> Result<()> {
    let (_temp_dir, pool, router, monitor, mistral) = setup().await?;
    pool.add(&NewCredential::mistral("mistral-cz", "ag:cz", "Czech"))
        .await?;
    mistral.fail_key("mistral-cz", ProviderFailure::RateLimited("429".to_string()));

    assert!(router.translate(&czech_job()).await.is_err());
    let cooling = pool.list(Provider::Mistral).await?;
    assert_eq!(cooling[0].status, CredentialStatus::Cooling);
    let until = cooling[0].cooldown_until.unwrap();

    // Before the window passes the sweep leaves it alone
    let report = monitor.sweep_at(Provider::Mistral, until - 1).await?;
    assert_eq!(report.probed, 0);

    mistral.heal_key("mistral-cz");
    let report = monitor.sweep_at(Provider::Mistral, until).await?;
    assert_eq!(report.recovered, 1);
    assert_eq!(
        pool.list(Provider::Mistral).await?[0].status,
        CredentialStatus::Active
    );

    assert_eq!(router.translate(&czech_job()).await?, "[CS] Ahoj");
    Ok(())
}

#[tokio::test]
async fn test_rejected_credential_purged_by_sweep() -> Result<()> {
    let (_temp_dir, pool, router, monitor, mistral) = setup().await?;
    pool.add(&NewCredential::mistral("revoked", "ag:cz", "Czech"))
        .await?;
    pool.add(&NewCredential::mistral("working", "ag:cz2", "Czech"))
        .await?;
    mistral.fail_key("revoked", ProviderFailure::Unauthorized("401".to_string()));

    assert_eq!(router.translate(&czech_job()).await?, "[CS] Ahoj");
    let statuses: Vec<CredentialStatus> = pool
        .list(Provider::Mistral)
        .await?
        .iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(statuses, vec![CredentialStatus::Invalid, CredentialStatus::Active]);

    let report = monitor.sweep(Provider::Mistral).await?;
    assert_eq!(report.removed, 1);
    assert_eq!(report.probed, 1);

    let left = pool.list(Provider::Mistral).await?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].api_key, "working");
    Ok(())
}
