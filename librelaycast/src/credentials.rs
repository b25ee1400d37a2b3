//! Translation credential pool
//!
//! Holds the provider accounts the router draws from and owns every health
//! transition a credential goes through:
//!
//! ```text
//!   Active --rate limited--> Cooling --probe ok / window elapsed--> Active
//!     |                         |
//!     +------unauthorized-------+------> Invalid --sweep--> (deleted)
//! ```
//!
//! Each transition is persisted before the call returns.
//!
//! # Example
//!
//! ```no_run
//! use librelaycast::credentials::CredentialPool;
//! use librelaycast::db::Database;
//! use librelaycast::types::{Language, NewCredential, Provider};
//!
//! # async fn example() -> librelaycast::error::Result<()> {
//! let db = Database::new("~/.local/share/relaycast/relay.db").await?;
//! let pool = CredentialPool::new(db);
//!
//! pool.add(&NewCredential::mistral("key", "ag:1234", "Czech")).await?;
//! let eligible = pool
//!     .list_eligible(Provider::Mistral, &Language::new("Czech", "CS"))
//!     .await?;
//! println!("{} usable credential(s)", eligible.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crate::db::Database;
use crate::error::{RelayError, Result};
use crate::types::{Credential, Language, NewCredential, Provider};

#[derive(Clone)]
pub struct CredentialPool {
    db: Database,
}

impl CredentialPool {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register a credential. Mistral credentials must name an agent and a language.
    pub async fn add(&self, credential: &NewCredential) -> Result<Credential> {
        if credential.api_key.trim().is_empty() {
            return Err(RelayError::InvalidInput("API key must not be empty".to_string()));
        }
        if credential.provider == Provider::Mistral
            && (credential.agent_id.is_none() || credential.language.is_none())
        {
            return Err(RelayError::InvalidInput(
                "Mistral credentials need an agent id and a language".to_string(),
            ));
        }

        let stored = self.db.insert_credential(credential).await?;
        tracing::info!(
            credential_id = stored.id,
            provider = %stored.provider,
            key = %stored.masked_key(),
            language = ?stored.language,
            "Credential added"
        );
        Ok(stored)
    }

    pub async fn remove(&self, id: i64) -> Result<bool> {
        let removed = self.db.delete_credential(id).await?;
        if removed {
            tracing::info!(credential_id = id, "Credential removed");
        }
        Ok(removed)
    }

    /// Every credential of a provider regardless of state
    pub async fn list(&self, provider: Provider) -> Result<Vec<Credential>> {
        self.db.list_credentials(provider).await
    }

    /// Credentials usable for `language` right now, first inserted first
    pub async fn list_eligible(
        &self,
        provider: Provider,
        language: &Language,
    ) -> Result<Vec<Credential>> {
        self.list_eligible_at(provider, language, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn list_eligible_at(
        &self,
        provider: Provider,
        language: &Language,
        now: i64,
    ) -> Result<Vec<Credential>> {
        self.db
            .eligible_credentials(provider, &language.name, now)
            .await
    }

    /// Start (or keep) a cooldown. An existing later expiry is never shortened.
    pub async fn mark_exhausted(&self, credential: &Credential, cooldown: Duration) -> Result<()> {
        self.mark_exhausted_at(credential, cooldown, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn mark_exhausted_at(
        &self,
        credential: &Credential,
        cooldown: Duration,
        now: i64,
    ) -> Result<()> {
        let until = now.saturating_add(i64::try_from(cooldown.as_secs()).unwrap_or(i64::MAX));
        if self.db.set_cooling(credential.id, until).await? {
            tracing::warn!(
                credential_id = credential.id,
                provider = %credential.provider,
                key = %credential.masked_key(),
                cooldown_secs = cooldown.as_secs(),
                "Credential exhausted, cooling down"
            );
        }
        Ok(())
    }

    /// Terminal: the credential is never offered again and is purged by the next sweep
    pub async fn mark_invalid(&self, credential: &Credential) -> Result<()> {
        if self.db.set_invalid(credential.id).await? {
            tracing::warn!(
                credential_id = credential.id,
                provider = %credential.provider,
                key = %credential.masked_key(),
                "Credential rejected by provider, marked invalid"
            );
        }
        Ok(())
    }

    /// Clear a cooldown; no-op for active or invalid credentials
    pub async fn mark_healthy(&self, credential: &Credential) -> Result<()> {
        if self.db.set_active(credential.id).await? {
            tracing::info!(
                credential_id = credential.id,
                provider = %credential.provider,
                key = %credential.masked_key(),
                "Credential recovered"
            );
        }
        Ok(())
    }

    /// Delete every invalid credential of a provider, returning how many went
    pub async fn purge_invalid(&self, provider: Provider) -> Result<u64> {
        let removed = self.db.delete_invalid_credentials(provider).await?;
        if removed > 0 {
            tracing::info!(provider = %provider, removed, "Purged invalid credentials");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialStatus;
    use tempfile::TempDir;

    async fn setup_pool() -> (CredentialPool, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pool.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (CredentialPool::new(db), temp_dir)
    }

    fn czech() -> Language {
        Language::new("Czech", "CS")
    }

    #[tokio::test]
    async fn test_exhausted_credential_excluded_until_window_passes() {
        let (pool, _temp_dir) = setup_pool().await;
        let credential = pool
            .add(&NewCredential::mistral("key-1", "agent", "Czech"))
            .await
            .unwrap();

        pool.mark_exhausted_at(&credential, Duration::from_secs(3600), 1_000)
            .await
            .unwrap();

        let during = pool
            .list_eligible_at(Provider::Mistral, &czech(), 1_000 + 3599)
            .await
            .unwrap();
        assert!(during.is_empty());

        let after = pool
            .list_eligible_at(Provider::Mistral, &czech(), 1_000 + 3600)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn test_shorter_cooldown_does_not_shorten() {
        let (pool, _temp_dir) = setup_pool().await;
        let credential = pool.add(&NewCredential::deepl("key-1")).await.unwrap();

        pool.mark_exhausted_at(&credential, Duration::from_secs(864_000), 0)
            .await
            .unwrap();
        pool.mark_exhausted_at(&credential, Duration::from_secs(60), 10)
            .await
            .unwrap();

        let stored = pool.database().get_credential(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Cooling);
        assert_eq!(stored.cooldown_until, Some(864_000));
    }

    #[tokio::test]
    async fn test_mark_healthy_is_noop_for_active() {
        let (pool, _temp_dir) = setup_pool().await;
        let credential = pool.add(&NewCredential::deepl("key-1")).await.unwrap();

        pool.mark_healthy(&credential).await.unwrap();
        let stored = pool.database().get_credential(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Active);

        pool.mark_exhausted(&credential, Duration::from_secs(60)).await.unwrap();
        pool.mark_healthy(&credential).await.unwrap();
        let stored = pool.database().get_credential(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Active);
        assert_eq!(stored.cooldown_until, None);
    }

    #[tokio::test]
    async fn test_invalid_credentials_are_purged() {
        let (pool, _temp_dir) = setup_pool().await;
        let bad = pool.add(&NewCredential::deepl("bad")).await.unwrap();
        pool.add(&NewCredential::deepl("good")).await.unwrap();

        pool.mark_invalid(&bad).await.unwrap();
        let eligible = pool
            .list_eligible(Provider::DeepL, &czech())
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].api_key, "good");

        assert_eq!(pool.purge_invalid(Provider::DeepL).await.unwrap(), 1);
        assert_eq!(pool.list(Provider::DeepL).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mistral_credential_requires_language() {
        let (pool, _temp_dir) = setup_pool().await;
        let mut credential = NewCredential::mistral("key", "agent", "Czech");
        credential.language = None;

        let result = pool.add(&credential).await;
        assert!(matches!(result, Err(RelayError::InvalidInput(_))));
    }
}
