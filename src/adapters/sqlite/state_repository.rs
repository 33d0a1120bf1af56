//! SQLite implementation of the state repository.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::sqlite::Sqlite;
use sqlx::SqlitePool;

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskErrorInfo, TaskState, TaskStatus, TaskType};
use crate::domain::ports::{StateRepository, StateTransaction};

const UPSERT_SQL: &str = r#"INSERT INTO task_states
    (exec_id, task_id, workflow_id, workflow_exec_id, parent_exec_id,
     execution_type, status, input, output, error, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(exec_id) DO UPDATE SET
        task_id = excluded.task_id,
        workflow_id = excluded.workflow_id,
        workflow_exec_id = excluded.workflow_exec_id,
        parent_exec_id = excluded.parent_exec_id,
        execution_type = excluded.execution_type,
        status = excluded.status,
        input = excluded.input,
        output = excluded.output,
        error = excluded.error,
        updated_at = excluded.updated_at"#;

/// State repository over a SQLite pool.
///
/// Carries a process-wide parent-read cache guarded by a `RwLock`; the cache
/// only short-circuits repeated parent reads within one burst of child
/// completions and is dropped on every write to the cached execution.
pub struct SqliteStateRepository {
    pool: SqlitePool,
    parent_cache: RwLock<HashMap<String, TaskState>>,
}

impl SqliteStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, parent_cache: RwLock::new(HashMap::new()) }
    }

    fn validate(state: &TaskState) -> OrchResult<()> {
        state.validate().map_err(OrchestrationError::InvalidState)
    }
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    async fn save_state(&self, state: &TaskState) -> OrchResult<()> {
        Self::validate(state)?;
        bind_state(sqlx::query(UPSERT_SQL), state)?.execute(&self.pool).await?;
        self.invalidate_parent_cache(&state.exec_id);
        Ok(())
    }

    async fn get_state(&self, exec_id: &str) -> OrchResult<TaskState> {
        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM task_states WHERE exec_id = ?")
                .bind(exec_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into)
            .transpose()?
            .ok_or_else(|| OrchestrationError::state_not_found(exec_id))
    }

    async fn get_parent_state(&self, exec_id: &str) -> OrchResult<TaskState> {
        if let Some(cached) = self
            .parent_cache
            .read()
            .ok()
            .and_then(|cache| cache.get(exec_id).cloned())
        {
            return Ok(cached);
        }

        let state = self.get_state(exec_id).await?;
        if let Ok(mut cache) = self.parent_cache.write() {
            cache.insert(exec_id.to_string(), state.clone());
        }
        Ok(state)
    }

    async fn list_children(&self, parent_exec_id: &str) -> OrchResult<Vec<TaskState>> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT * FROM task_states WHERE parent_exec_id = ? ORDER BY exec_id",
        )
        .bind(parent_exec_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_states(&self, workflow_exec_id: &str) -> OrchResult<Vec<TaskState>> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT * FROM task_states WHERE workflow_exec_id = ? ORDER BY exec_id",
        )
        .bind(workflow_exec_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn begin(&self) -> OrchResult<Box<dyn StateTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteStateTransaction { tx }))
    }

    fn invalidate_parent_cache(&self, exec_id: &str) {
        if let Ok(mut cache) = self.parent_cache.write() {
            cache.remove(exec_id);
        }
    }
}

/// One open SQLite transaction over task states.
pub struct SqliteStateTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl StateTransaction for SqliteStateTransaction {
    async fn get_state_for_update(&mut self, exec_id: &str) -> OrchResult<TaskState> {
        // SQLite has no row-level SELECT ... FOR UPDATE. Touching the row
        // promotes this transaction to the database write lock, which blocks
        // concurrent writers of the same execution until commit.
        sqlx::query("UPDATE task_states SET exec_id = exec_id WHERE exec_id = ?")
            .bind(exec_id)
            .execute(&mut *self.tx)
            .await?;

        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM task_states WHERE exec_id = ?")
                .bind(exec_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        row.map(TryInto::try_into)
            .transpose()?
            .ok_or_else(|| OrchestrationError::state_not_found(exec_id))
    }

    async fn save_state(&mut self, state: &TaskState) -> OrchResult<()> {
        SqliteStateRepository::validate(state)?;
        bind_state(sqlx::query(UPSERT_SQL), state)?.execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> OrchResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> OrchResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_state<'q>(query: SqliteQuery<'q>, state: &TaskState) -> OrchResult<SqliteQuery<'q>> {
    let input_json = state.input.as_ref().map(serde_json::to_string).transpose()?;
    let output_json = state.output.as_ref().map(serde_json::to_string).transpose()?;
    let error_json = state.error.as_ref().map(serde_json::to_string).transpose()?;

    Ok(query
        .bind(state.exec_id.clone())
        .bind(state.task_id.clone())
        .bind(state.workflow_id.clone())
        .bind(state.workflow_exec_id.clone())
        .bind(state.parent_exec_id.clone())
        .bind(state.execution_type.as_str())
        .bind(state.status.as_str())
        .bind(input_json)
        .bind(output_json)
        .bind(error_json)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339()))
}

#[derive(sqlx::FromRow)]
struct StateRow {
    exec_id: String,
    task_id: String,
    workflow_id: String,
    workflow_exec_id: String,
    parent_exec_id: Option<String>,
    execution_type: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<StateRow> for TaskState {
    type Error = OrchestrationError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        let execution_type = TaskType::from_str(&row.execution_type).ok_or_else(|| {
            OrchestrationError::Serialization(format!(
                "Invalid execution_type: {}",
                row.execution_type
            ))
        })?;
        let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
            OrchestrationError::Serialization(format!("Invalid status: {}", row.status))
        })?;

        let input = row.input.as_deref().map(serde_json::from_str).transpose()?;
        let output = row.output.as_deref().map(serde_json::from_str).transpose()?;
        let error: Option<TaskErrorInfo> =
            row.error.as_deref().map(serde_json::from_str).transpose()?;

        Ok(TaskState {
            exec_id: row.exec_id,
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            workflow_exec_id: row.workflow_exec_id,
            parent_exec_id: row.parent_exec_id,
            execution_type,
            status,
            input,
            output,
            error,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::open_in_memory;
    use serde_json::json;

    async fn setup() -> SqliteStateRepository {
        let pool = open_in_memory().await.unwrap();
        SqliteStateRepository::new(pool)
    }

    fn state(task_id: &str) -> TaskState {
        TaskState::new(task_id, "wf", "wf-exec-1", TaskType::Basic)
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let repo = setup().await;
        let mut s = state("task-a");
        s.output = Some(json!({"n": 1}));
        s.error = Some(TaskErrorInfo::new("nope"));

        repo.save_state(&s).await.unwrap();
        let loaded = repo.get_state(&s.exec_id).await.unwrap();
        assert_eq!(loaded.task_id, "task-a");
        assert_eq!(loaded.output, Some(json!({"n": 1})));
        assert_eq!(loaded.error.unwrap().message, "nope");
    }

    #[tokio::test]
    async fn test_save_rejects_empty_ids() {
        let repo = setup().await;
        let mut s = state("task-a");
        s.exec_id = String::new();
        let err = repo.save_state(&s).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let repo = setup().await;
        let err = repo.get_state("missing").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let repo = setup().await;
        let mut s = state("task-a");
        repo.save_state(&s).await.unwrap();

        s.force_status(TaskStatus::Success, "test setup");
        s.output = Some(json!({"done": true}));
        repo.save_state(&s).await.unwrap();

        let loaded = repo.get_state(&s.exec_id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Success);
        assert_eq!(loaded.output, Some(json!({"done": true})));
    }

    #[tokio::test]
    async fn test_list_children_ordered_by_exec_id() {
        let repo = setup().await;
        let parent = state("parent");
        repo.save_state(&parent).await.unwrap();

        for i in 0..3 {
            let mut child = state(&format!("child-{i}"));
            child.exec_id = format!("exec-{}", 2 - i); // insert out of order
            child.parent_exec_id = Some(parent.exec_id.clone());
            repo.save_state(&child).await.unwrap();
        }

        let children = repo.list_children(&parent.exec_id).await.unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.exec_id.as_str()).collect();
        assert_eq!(ids, vec!["exec-0", "exec-1", "exec-2"]);
    }

    #[tokio::test]
    async fn test_parent_cache_invalidated_on_save() {
        let repo = setup().await;
        let mut s = state("parent");
        repo.save_state(&s).await.unwrap();

        // Prime the cache
        let cached = repo.get_parent_state(&s.exec_id).await.unwrap();
        assert_eq!(cached.status, TaskStatus::Pending);

        // A write must drop the cached copy
        s.force_status(TaskStatus::Running, "test setup");
        repo.save_state(&s).await.unwrap();
        let fresh = repo.get_parent_state(&s.exec_id).await.unwrap();
        assert_eq!(fresh.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let repo = setup().await;
        let s = state("task-a");
        repo.save_state(&s).await.unwrap();

        // Committed mutation is visible
        let mut tx = repo.begin().await.unwrap();
        let mut locked = tx.get_state_for_update(&s.exec_id).await.unwrap();
        locked.transition_to(TaskStatus::Running).unwrap();
        tx.save_state(&locked).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.get_state(&s.exec_id).await.unwrap().status, TaskStatus::Running);

        // Rolled-back mutation is not
        let mut tx = repo.begin().await.unwrap();
        let mut locked = tx.get_state_for_update(&s.exec_id).await.unwrap();
        locked.transition_to(TaskStatus::Success).unwrap();
        tx.save_state(&locked).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(repo.get_state(&s.exec_id).await.unwrap().status, TaskStatus::Running);
    }
}
