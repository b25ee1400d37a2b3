//! Operator-mutable runtime settings

use tracing::{info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::types::Provider;

const CURRENT_PROVIDER: &str = "current_translator";

/// The provider translations try first, switchable while the daemon runs.
///
/// Read once per fan-out run and passed into every job of that run.
#[derive(Clone)]
pub struct ProviderSwitch {
    db: Database,
    default: Provider,
}

impl ProviderSwitch {
    pub fn new(db: Database, default: Provider) -> Self {
        Self { db, default }
    }

    pub async fn current(&self) -> Result<Provider> {
        match self.db.get_setting(CURRENT_PROVIDER).await? {
            Some(value) => match value.parse() {
                Ok(provider) => Ok(provider),
                Err(e) => {
                    warn!("Ignoring stored provider setting: {}", e);
                    Ok(self.default)
                }
            },
            None => Ok(self.default),
        }
    }

    pub async fn set(&self, provider: Provider) -> Result<()> {
        self.db
            .set_setting(CURRENT_PROVIDER, provider.as_str())
            .await?;
        info!(provider = %provider, "Current provider switched");
        Ok(())
    }

    /// Flip to the other provider, returning the new one
    pub async fn toggle(&self) -> Result<Provider> {
        let next = self.current().await?.other();
        self.set(next).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_then_toggle() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("s.db").to_str().unwrap())
            .await
            .unwrap();
        let switch = ProviderSwitch::new(db.clone(), Provider::DeepL);

        assert_eq!(switch.current().await.unwrap(), Provider::DeepL);
        assert_eq!(switch.toggle().await.unwrap(), Provider::Mistral);
        assert_eq!(switch.current().await.unwrap(), Provider::Mistral);

        db.set_setting(CURRENT_PROVIDER, "google").await.unwrap();
        assert_eq!(switch.current().await.unwrap(), Provider::DeepL);
    }
}
