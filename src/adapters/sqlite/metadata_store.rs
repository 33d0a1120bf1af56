//! SQLite implementation of the metadata store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::domain::errors::OrchResult;
use crate::domain::ports::MetadataStore;

/// Namespaced KV store over a single `task_metadata` table.
///
/// Payloads are opaque JSON blobs; orchestrators serialize whatever they
/// need into one value per key.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn store(&self, key: &str, value: &Value) -> OrchResult<()> {
        let payload = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO task_metadata (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> OrchResult<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM task_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(payload,)| serde_json::from_str(&payload))
            .transpose()
            .map_err(Into::into)
    }

    async fn delete(&self, key: &str) -> OrchResult<()> {
        sqlx::query("DELETE FROM task_metadata WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> OrchResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM task_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}
