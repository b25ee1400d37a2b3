//! Destination registry and language resolution
//!
//! Bindings live in their own table; this module exposes only the two
//! directional lookups (destination to language, language to destinations).

use crate::db::Database;
use crate::error::{RelayError, Result};
use crate::types::{Destination, Language};

#[derive(Clone)]
pub struct DestinationResolver {
    db: Database,
    default_language: Language,
}

impl DestinationResolver {
    /// `default_language` is what unbound destinations get: the source language, no translation
    pub fn new(db: Database, default_language: Language) -> Self {
        Self {
            db,
            default_language,
        }
    }

    pub fn default_language(&self) -> &Language {
        &self.default_language
    }

    pub async fn resolve_language(&self, destination_id: &str) -> Result<Language> {
        Ok(self
            .db
            .language_for_destination(destination_id)
            .await?
            .unwrap_or_else(|| self.default_language.clone()))
    }

    pub async fn destinations_for(&self, language: &str) -> Result<Vec<Destination>> {
        self.db.destinations_for_language(language).await
    }

    pub async fn list(&self) -> Result<Vec<Destination>> {
        self.db.list_destinations().await
    }

    pub async fn add(&self, destination: &Destination) -> Result<()> {
        if destination.channel_id.trim().is_empty() {
            return Err(RelayError::InvalidInput(
                "Destination channel id must not be empty".to_string(),
            ));
        }
        self.db.upsert_destination(destination).await?;
        tracing::info!(channel_id = %destination.channel_id, name = %destination.name, "Destination saved");
        Ok(())
    }

    pub async fn remove(&self, destination_id: &str) -> Result<bool> {
        self.db.delete_destination(destination_id).await
    }

    /// Bind a destination to a registered language, replacing an earlier binding
    pub async fn bind(&self, destination_id: &str, language: &str) -> Result<()> {
        if self.db.get_destination(destination_id).await?.is_none() {
            return Err(RelayError::InvalidInput(format!(
                "Unknown destination: {}",
                destination_id
            )));
        }
        if !self.db.bind_language(destination_id, language).await? {
            return Err(RelayError::InvalidInput(format!(
                "Unknown language: {}",
                language
            )));
        }
        tracing::info!(channel_id = %destination_id, language, "Destination bound to language");
        Ok(())
    }

    pub async fn unbind(&self, destination_id: &str) -> Result<bool> {
        self.db.unbind_language(destination_id).await
    }

    pub async fn register_language(&self, language: &Language) -> Result<()> {
        if language.name.trim().is_empty() || language.code.trim().is_empty() {
            return Err(RelayError::InvalidInput(
                "Language needs a name and a code".to_string(),
            ));
        }
        self.db.create_language(language).await?;
        Ok(())
    }

    pub async fn languages(&self) -> Result<Vec<Language>> {
        self.db.list_languages().await
    }

    /// Remove a language; destinations bound to it fall back to the default
    pub async fn remove_language(&self, name: &str) -> Result<bool> {
        self.db.delete_language(name).await
    }
}
