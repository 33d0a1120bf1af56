//! Transactional state mutation.
//!
//! Every mutation of a persisted task state goes through here: load the row
//! under its lock, mutate, save, commit. The merge in
//! [`TransactionService::save_state_with_locking`] is deliberately narrow
//! (status, output, error, input-when-previously-nil) so a concurrent
//! writer's fields, such as ids, linkage, or an input already present, are
//! never clobbered.

use std::sync::Arc;

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::TaskState;
use crate::domain::ports::StateRepository;

pub struct TransactionService {
    states: Arc<dyn StateRepository>,
}

impl TransactionService {
    pub fn new(states: Arc<dyn StateRepository>) -> Self {
        Self { states }
    }

    /// Persist `state`'s result fields onto the locked, current row.
    ///
    /// Returns the merged state as persisted.
    pub async fn save_state_with_locking(&self, state: &TaskState) -> OrchResult<TaskState> {
        if state.exec_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "cannot save a task state without an exec id".to_string(),
            ));
        }

        let mut tx = self.states.begin().await?;
        let mut target = match tx.get_state_for_update(&state.exec_id).await {
            Ok(target) => target,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        target.status = state.status;
        target.output.clone_from(&state.output);
        target.error.clone_from(&state.error);
        if target.input.is_none() {
            target.input.clone_from(&state.input);
        }
        target.updated_at = chrono::Utc::now();

        if let Err(err) = tx.save_state(&target).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        self.states.invalidate_parent_cache(&state.exec_id);
        Ok(target)
    }

    /// Run `f` against the locked state and persist the result atomically.
    ///
    /// An error from `f` aborts the transaction; nothing is written.
    pub async fn apply_transformation<F>(&self, exec_id: &str, f: F) -> OrchResult<TaskState>
    where
        F: FnOnce(&mut TaskState) -> OrchResult<()> + Send,
    {
        let mut tx = self.states.begin().await?;
        let mut state = match tx.get_state_for_update(exec_id).await {
            Ok(state) => state,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        if let Err(err) = f(&mut state) {
            tx.rollback().await?;
            return Err(OrchestrationError::TaskProcessing { source: Box::new(err) });
        }
        state.updated_at = chrono::Utc::now();

        if let Err(err) = tx.save_state(&state).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        self.states.invalidate_parent_cache(exec_id);
        Ok(state)
    }
}
