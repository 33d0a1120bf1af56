//! SQLite adapters for the persistence ports.
//!
//! [`open`] is the one-call entrypoint: pool plus schema. Tests use
//! [`open_in_memory`] for a throwaway database with the same schema.

pub mod metadata_store;
pub mod pool;
pub mod schema;
pub mod state_repository;

pub use metadata_store::SqliteMetadataStore;
pub use pool::{connect, connect_in_memory, SqliteOptions};
pub use state_repository::SqliteStateRepository;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{OrchResult, OrchestrationError};

/// Open a file-backed database ready for use: connect, then bring the
/// schema up to date.
pub async fn open(url: &str) -> OrchResult<SqlitePool> {
    let db = connect(url, SqliteOptions::default()).await?;
    schema::apply(&db).await?;
    Ok(db)
}

/// In-memory database with the full schema applied, for tests.
pub async fn open_in_memory() -> OrchResult<SqlitePool> {
    let db = connect_in_memory().await?;
    schema::apply(&db).await?;
    Ok(db)
}

/// Timestamps are stored as RFC3339 text; parse one back out of a row.
pub fn parse_datetime(s: &str) -> OrchResult<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrchestrationError::Serialization(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_is_ready_for_writes() {
        let pool = open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO task_metadata (key, value, updated_at) VALUES ('k', '1', 'now')")
            .execute(&pool)
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_datetime() {
        let parsed = parse_datetime("2026-08-01T10:30:00Z").unwrap();
        assert_eq!(parsed.timestamp(), 1_785_580_200);
        assert!(parse_datetime("not a timestamp").is_err());
    }
}
