//! Database operations for Relaycast
//!
//! Every credential state transition is a single SQL statement so that
//! concurrent writers (live routing and the health sweep) never observe a
//! half-applied change.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{
    Credential, CredentialStatus, Delivery, Destination, Language, NewCredential, Provider,
};

const CREDENTIAL_COLUMNS: &str =
    "id, provider, api_key, agent_id, language, status, cooldown_until, created_at";

const DESTINATION_COLUMNS: &str = "d.channel_id, d.name, d.branding, d.link_discussion, \
     d.text_discussion, d.link_invitation, d.text_invitation";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Languages
    // ------------------------------------------------------------------

    /// Register a language, returning its row id
    pub async fn create_language(&self, language: &Language) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO languages (name, code, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&language.name)
        .bind(&language.code)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_language(&self, name: &str) -> Result<Option<Language>> {
        let row = sqlx::query("SELECT name, code FROM languages WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Language::new(r.get::<String, _>("name"), r.get::<String, _>("code"))))
    }

    pub async fn list_languages(&self) -> Result<Vec<Language>> {
        let rows = sqlx::query("SELECT name, code FROM languages ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| Language::new(r.get::<String, _>("name"), r.get::<String, _>("code")))
            .collect())
    }

    /// Delete a language together with its bindings
    pub async fn delete_language(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM languages WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn insert_credential(&self, credential: &NewCredential) -> Result<Credential> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO credentials (provider, api_key, agent_id, language, status, created_at)
            VALUES (?, ?, ?, ?, 'active', ?)
            "#,
        )
        .bind(credential.provider.as_str())
        .bind(&credential.api_key)
        .bind(&credential.agent_id)
        .bind(&credential.language)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(Credential {
            id: result.last_insert_rowid(),
            provider: credential.provider,
            api_key: credential.api_key.clone(),
            agent_id: credential.agent_id.clone(),
            language: credential.language.clone(),
            status: CredentialStatus::Active,
            cooldown_until: None,
            created_at: now,
        })
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE id = ?",
            CREDENTIAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(credential_from_row).transpose()
    }

    /// All credentials of a provider in insertion order, whatever their state
    pub async fn list_credentials(&self, provider: Provider) -> Result<Vec<Credential>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE provider = ? ORDER BY id ASC",
            CREDENTIAL_COLUMNS
        ))
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(credential_from_row).collect()
    }

    /// Usable credentials for a language at `now`, in insertion order.
    ///
    /// A cooling credential becomes usable again once its window has passed,
    /// even before the health sweep flips it back to active.
    pub async fn eligible_credentials(
        &self,
        provider: Provider,
        language: &str,
        now: i64,
    ) -> Result<Vec<Credential>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM credentials
            WHERE provider = ?
              AND (language IS NULL OR language = ?)
              AND (status = 'active'
                   OR (status = 'cooling' AND (cooldown_until IS NULL OR cooldown_until <= ?)))
            ORDER BY id ASC
            "#,
            CREDENTIAL_COLUMNS
        ))
        .bind(provider.as_str())
        .bind(language)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(credential_from_row).collect()
    }

    /// Move a credential to cooling. An existing later expiry is kept.
    pub async fn set_cooling(&self, id: i64, until: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET status = 'cooling',
                cooldown_until = CASE
                    WHEN status = 'cooling' AND cooldown_until IS NOT NULL AND cooldown_until > ?
                        THEN cooldown_until
                    ELSE ?
                END
            WHERE id = ? AND status != 'invalid'
            "#,
        )
        .bind(until)
        .bind(until)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_invalid(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials SET status = 'invalid', cooldown_until = NULL
            WHERE id = ? AND status != 'invalid'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns true only when the credential was not already active
    pub async fn set_active(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials SET status = 'active', cooldown_until = NULL
            WHERE id = ? AND status = 'cooling'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_credential(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every invalid credential of a provider
    pub async fn delete_invalid_credentials(&self, provider: Provider) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credentials WHERE provider = ? AND status = 'invalid'")
            .bind(provider.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Destinations and language bindings
    // ------------------------------------------------------------------

    /// Insert or update a destination
    pub async fn upsert_destination(&self, destination: &Destination) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO destinations
                (channel_id, name, branding, link_discussion, text_discussion,
                 link_invitation, text_invitation, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel_id) DO UPDATE SET
                name = excluded.name,
                branding = excluded.branding,
                link_discussion = excluded.link_discussion,
                text_discussion = excluded.text_discussion,
                link_invitation = excluded.link_invitation,
                text_invitation = excluded.text_invitation
            "#,
        )
        .bind(&destination.channel_id)
        .bind(&destination.name)
        .bind(destination.branding)
        .bind(&destination.link_discussion)
        .bind(&destination.text_discussion)
        .bind(&destination.link_invitation)
        .bind(&destination.text_invitation)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_destination(&self, channel_id: &str) -> Result<Option<Destination>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM destinations d WHERE d.channel_id = ?",
            DESTINATION_COLUMNS
        ))
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(destination_from_row))
    }

    pub async fn list_destinations(&self) -> Result<Vec<Destination>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM destinations d ORDER BY d.created_at, d.rowid",
            DESTINATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(destination_from_row).collect())
    }

    pub async fn delete_destination(&self, channel_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM destinations WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Bind a destination to a language, replacing any previous binding.
    ///
    /// Returns false when the language is not registered.
    pub async fn bind_language(&self, channel_id: &str, language: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO language_bindings (channel_id, language_id, created_at)
            SELECT ?, id, ? FROM languages WHERE name = ?
            ON CONFLICT(channel_id) DO UPDATE SET
                language_id = excluded.language_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(channel_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(language)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn unbind_language(&self, channel_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM language_bindings WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn language_for_destination(&self, channel_id: &str) -> Result<Option<Language>> {
        let row = sqlx::query(
            r#"
            SELECT l.name, l.code
            FROM language_bindings b
            JOIN languages l ON l.id = b.language_id
            WHERE b.channel_id = ?
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Language::new(r.get::<String, _>("name"), r.get::<String, _>("code"))))
    }

    pub async fn destinations_for_language(&self, language: &str) -> Result<Vec<Destination>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM destinations d
            JOIN language_bindings b ON b.channel_id = d.channel_id
            JOIN languages l ON l.id = b.language_id
            WHERE l.name = ?
            ORDER BY d.created_at, d.rowid
            "#,
            DESTINATION_COLUMNS
        ))
        .bind(language)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(destination_from_row).collect())
    }

    pub async fn unbound_destinations(&self) -> Result<Vec<Destination>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM destinations d
            WHERE d.channel_id NOT IN (SELECT channel_id FROM language_bindings)
            ORDER BY d.created_at, d.rowid
            "#,
            DESTINATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(destination_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Delivery ledger
    // ------------------------------------------------------------------

    /// Record the messages sent to one destination; replaces an earlier record
    pub async fn record_delivery(
        &self,
        source_post_id: &str,
        channel_id: &str,
        message_ids: &[i64],
        sent_at: i64,
    ) -> Result<()> {
        let encoded = serde_json::to_string(message_ids).map_err(|e| DbError::CorruptRow {
            table: "deliveries",
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO deliveries (source_post_id, channel_id, message_ids, sent_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_post_id, channel_id) DO UPDATE SET
                message_ids = excluded.message_ids,
                sent_at = excluded.sent_at
            "#,
        )
        .bind(source_post_id)
        .bind(channel_id)
        .bind(encoded)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn deliveries_for(&self, source_post_id: &str) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            r#"
            SELECT channel_id, message_ids, sent_at
            FROM deliveries
            WHERE source_post_id = ?
            ORDER BY sent_at, rowid
            "#,
        )
        .bind(source_post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let raw: String = r.get("message_ids");
                let message_ids: Vec<i64> =
                    serde_json::from_str(&raw).map_err(|e| DbError::CorruptRow {
                        table: "deliveries",
                        reason: e.to_string(),
                    })?;
                Ok(Delivery {
                    destination_id: r.get("channel_id"),
                    message_ids,
                    sent_at: r.get("sent_at"),
                })
            })
            .collect()
    }

    pub async fn forget_delivery(&self, source_post_id: &str, channel_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM deliveries WHERE source_post_id = ? AND channel_id = ?")
                .bind(source_post_id)
                .bind(channel_id)
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (name, value) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn credential_from_row(r: &SqliteRow) -> Result<Credential> {
    let provider: String = r.get("provider");
    let status: String = r.get("status");

    Ok(Credential {
        id: r.get("id"),
        provider: provider.parse().map_err(|reason| DbError::CorruptRow {
            table: "credentials",
            reason,
        })?,
        api_key: r.get("api_key"),
        agent_id: r.get("agent_id"),
        language: r.get("language"),
        status: status.parse().map_err(|reason| DbError::CorruptRow {
            table: "credentials",
            reason,
        })?,
        cooldown_until: r.get("cooldown_until"),
        created_at: r.get("created_at"),
    })
}

fn destination_from_row(r: &SqliteRow) -> Destination {
    Destination {
        channel_id: r.get("channel_id"),
        name: r.get("name"),
        branding: r.get::<i64, _>("branding") != 0,
        link_discussion: r.get("link_discussion"),
        text_discussion: r.get("text_discussion"),
        link_invitation: r.get("link_invitation"),
        text_invitation: r.get("text_invitation"),
    }
}
