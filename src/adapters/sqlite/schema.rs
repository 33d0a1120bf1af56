//! Schema for the task-state and metadata tables.
//!
//! Versioning rides SQLite's `user_version` pragma: each entry in
//! [`SCHEMA_STEPS`] bumps it by one when applied, so an existing database
//! only replays the steps it has not seen. No bookkeeping table needed.

use sqlx::SqlitePool;

use crate::domain::errors::{OrchResult, OrchestrationError};

/// Ordered schema steps. Append-only: editing an applied step silently
/// diverges existing databases.
const SCHEMA_STEPS: &[&str] = &[
    // v1: task states with parent/workflow lookup indexes, plus the
    // orchestrator metadata KV.
    "CREATE TABLE IF NOT EXISTS task_states (
        exec_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        workflow_exec_id TEXT NOT NULL,
        parent_exec_id TEXT,
        execution_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT,
        output TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_task_states_parent
        ON task_states(parent_exec_id);
    CREATE INDEX IF NOT EXISTS idx_task_states_workflow_exec
        ON task_states(workflow_exec_id);
    CREATE TABLE IF NOT EXISTS task_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

/// Bring a database up to the current schema. Returns how many steps ran.
pub async fn apply(pool: &SqlitePool) -> OrchResult<usize> {
    let from = current_version(pool).await?;
    let mut ran = 0;

    for (index, step) in SCHEMA_STEPS.iter().enumerate().skip(from) {
        for statement in step.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await.map_err(|e| {
                OrchestrationError::Database(format!(
                    "schema step {} failed: {e}",
                    index + 1
                ))
            })?;
        }
        // PRAGMA takes no bind parameters; the value is a trusted integer.
        sqlx::query(&format!("PRAGMA user_version = {}", index + 1))
            .execute(pool)
            .await?;
        ran += 1;
    }

    if ran > 0 {
        tracing::debug!(from, to = SCHEMA_STEPS.len(), "Applied schema steps");
    }
    Ok(ran)
}

/// The schema version recorded in the database (0 for a fresh file).
pub async fn current_version(pool: &SqlitePool) -> OrchResult<usize> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version").fetch_one(pool).await?;
    usize::try_from(version)
        .map_err(|_| OrchestrationError::Database(format!("negative user_version: {version}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::connect_in_memory;

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 0);

        assert_eq!(apply(&pool).await.unwrap(), SCHEMA_STEPS.len());
        assert_eq!(current_version(&pool).await.unwrap(), SCHEMA_STEPS.len());

        // Nothing left to replay
        assert_eq!(apply(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schema_creates_both_tables() {
        let pool = connect_in_memory().await.unwrap();
        apply(&pool).await.unwrap();

        for table in ["task_states", "task_metadata"] {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
