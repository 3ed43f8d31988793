//! SQLite-backed metadata store
//!
//! Acts as the external key/value service: several server processes can
//! point at the same database. Each merge is a read-modify-write inside an
//! immediate transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use super::types::{fields_expired, merge_fields, stamp_new_record, RecordFields};
use super::{MetadataStore, StoreError, StoreSettings};

pub struct SqliteStore {
    pool: SqlitePool,
    settings: StoreSettings,
}

impl SqliteStore {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str, settings: StoreSettings) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // In-memory databases are per connection, so keep exactly one
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, settings).await
    }

    pub async fn with_pool(pool: SqlitePool, settings: StoreSettings) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tus_records (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, settings })
    }

    /// Read-merge-write of one row; runs inside the caller's transaction
    async fn merge_row(
        &self,
        conn: &mut SqliteConnection,
        stored: &str,
        fields: RecordFields,
    ) -> Result<(), StoreError> {
        let existing = sqlx::query_scalar::<_, String>("SELECT payload FROM tus_records WHERE key = ?")
            .bind(stored)
            .fetch_optional(&mut *conn)
            .await?;

        let record = match existing {
            Some(payload) => {
                let mut record = Self::decode(&payload)?;
                merge_fields(&mut record, fields);
                record
            }
            None => {
                let mut record = fields;
                stamp_new_record(&mut record, self.settings.ttl_secs);
                record
            }
        };

        sqlx::query("INSERT OR REPLACE INTO tus_records (key, payload) VALUES (?, ?)")
            .bind(stored)
            .bind(serde_json::to_string(&record)?)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    fn decode(payload: &str) -> Result<RecordFields, StoreError> {
        match serde_json::from_str::<Value>(payload)? {
            Value::Object(record) => Ok(record),
            _ => Err(StoreError::InvalidRecord("payload is not a JSON object".to_string())),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn set_prefix(&mut self, prefix: &str) {
        self.settings.prefix = prefix.to_string();
    }

    async fn get(&self, key: &str, include_expired: bool) -> Result<Option<RecordFields>, StoreError> {
        let payload = sqlx::query_scalar::<_, String>("SELECT payload FROM tus_records WHERE key = ?")
            .bind(self.settings.namespaced(key))
            .fetch_optional(&self.pool)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let record = Self::decode(&payload)?;
        if !include_expired && fields_expired(&record, Utc::now()) {
            return Ok(None);
        }

        Ok(Some(record))
    }

    async fn set(&self, key: &str, fields: RecordFields) -> Result<(), StoreError> {
        let stored = self.settings.namespaced(key);
        let mut conn = self.pool.acquire().await?;

        // Take the write lock up front so concurrent merges serialize
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self.merge_row(&mut conn, &stored, fields).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(key = %stored, error = %rollback, "Rollback after failed merge failed");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query("DELETE FROM tus_records WHERE key = ?")
            .bind(self.settings.namespaced(key))
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(removed > 0)
    }

    async fn delete_all(&self, keys: &[String]) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for key in keys {
            removed += sqlx::query("DELETE FROM tus_records WHERE key = ?")
                .bind(self.settings.namespaced(key))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = &self.settings.prefix;
        let stored = sqlx::query_scalar::<_, String>(
            "SELECT key FROM tus_records WHERE substr(key, 1, length(?)) = ?",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(stored
            .iter()
            .filter_map(|key| self.settings.strip(key))
            .map(str::to_string)
            .collect())
    }
}
