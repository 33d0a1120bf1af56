//! Task-state repository port.

use async_trait::async_trait;

use crate::domain::errors::OrchResult;
use crate::domain::models::TaskState;

/// Repository interface for task-state persistence.
///
/// Per-execution serialization is enforced here: mutations of a single
/// execution go through [`StateTransaction::get_state_for_update`], which
/// holds the store's write lock on that row until commit.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Transactional upsert of a state. Fails with `InvalidState` when the
    /// exec id or task id is empty.
    async fn save_state(&self, state: &TaskState) -> OrchResult<()>;

    /// Get a state by execution id; `NotFound` when unknown.
    async fn get_state(&self, exec_id: &str) -> OrchResult<TaskState>;

    /// Get a state through the parent-read cache.
    ///
    /// The cache short-circuits repeated reads of the same parent during a
    /// burst of child completions; it is coherent only for the duration of
    /// one parent-status-update flow and is invalidated on every write to
    /// the cached execution.
    async fn get_parent_state(&self, exec_id: &str) -> OrchResult<TaskState>;

    /// All direct children of a parent execution, ordered by exec id so
    /// enumeration is deterministic for replay.
    async fn list_children(&self, parent_exec_id: &str) -> OrchResult<Vec<TaskState>>;

    /// All states of one workflow execution, ordered by exec id.
    async fn list_states(&self, workflow_exec_id: &str) -> OrchResult<Vec<TaskState>>;

    /// Open a transaction scope. Dropping the returned handle without
    /// committing rolls back.
    async fn begin(&self) -> OrchResult<Box<dyn StateTransaction>>;

    /// Drop a cached parent read after a write outside this repository's
    /// view (e.g. a committed transaction).
    fn invalidate_parent_cache(&self, exec_id: &str);
}

/// One open transaction against the state store.
///
/// `get_state_for_update` followed by `save_state` is atomic; concurrent
/// writers of the same execution block on the row lock until commit.
#[async_trait]
pub trait StateTransaction: Send {
    /// Load a state and acquire its row-level write lock.
    async fn get_state_for_update(&mut self, exec_id: &str) -> OrchResult<TaskState>;

    /// Upsert inside this transaction.
    async fn save_state(&mut self, state: &TaskState) -> OrchResult<()>;

    async fn commit(self: Box<Self>) -> OrchResult<()>;

    async fn rollback(self: Box<Self>) -> OrchResult<()>;
}
