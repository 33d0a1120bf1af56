//! Activity adapter.
//!
//! The boundary the durable workflow runtime drives. Requests and responses
//! are the shared records of [`super::orchestrators`]; no orchestrator
//! internals cross it. The runtime is responsible for scheduling the
//! children and transitions each call reports back.

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::TaskState;
use crate::services::orchestrators::{
    CreateStateInput, CreatedChild, HandleResponseInput, OrchestratorContext, TaskResponseEnvelope,
};

pub struct ActivityAdapter {
    ctx: OrchestratorContext,
}

impl ActivityAdapter {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Create the initial state for one task execution. Child-bearing tasks
    /// also get their children prepared (not yet created).
    pub async fn create_task_state(&self, input: &CreateStateInput) -> OrchResult<TaskState> {
        let orchestrator = self.ctx.factory.create(input.task_config.task_type, &self.ctx)?;
        let state = orchestrator.create_state(input).await?;
        if let Some(manager) = orchestrator.as_child_manager() {
            manager.prepare_children(input, &state).await?;
        }
        Ok(state)
    }

    /// Materialize the next cycle of child states under a prepared parent:
    /// all at once for parallel, the next batch for collection, the current
    /// step for composite. Exhausted parents create nothing; the runtime
    /// re-invokes between cycles.
    pub async fn create_child_states(
        &self,
        input: &CreateStateInput,
        parent_exec_id: &str,
    ) -> OrchResult<Vec<CreatedChild>> {
        let parent = self.ctx.states.get_state(parent_exec_id).await?;
        let orchestrator = self.ctx.factory.create(parent.execution_type, &self.ctx)?;
        match orchestrator.as_child_manager() {
            Some(manager) => manager.create_children(input, &parent).await,
            None => Ok(Vec::new()),
        }
    }

    /// Run the response flow for a completed invocation.
    ///
    /// An incoming signal is dispatched through the orchestrator's
    /// [`SignalHandler`](crate::services::orchestrators::SignalHandler)
    /// capability first: validation rejects it without touching the state,
    /// and an accepted signal's output feeds the normal response flow.
    pub async fn handle_task_response(
        &self,
        input: &HandleResponseInput,
    ) -> OrchResult<TaskResponseEnvelope> {
        let orchestrator = self.ctx.factory.create(input.task_config.task_type, &self.ctx)?;

        if let Some(signal) = &input.signal {
            let Some(handler) = orchestrator.as_signal_handler() else {
                return Err(OrchestrationError::SignalRejected(format!(
                    "task {} ({}) does not consume signals",
                    input.task_config.id,
                    input.task_config.task_type.as_str()
                )));
            };
            handler.validate_signal(&input.task_config, signal)?;
            let output = handler.process_signal(&input.state, signal)?;

            let mut accepted = input.clone();
            accepted.output = Some(output);
            accepted.execution_error = None;
            accepted.signal = None;
            return orchestrator.handle_response(&accepted).await;
        }

        orchestrator.handle_response(input).await
    }

    /// Workflow-boundary bookkeeping: evict this execution's parent-context
    /// cache entries.
    pub fn end_workflow(&self, workflow_id: &str, workflow_exec_id: &str) {
        self.ctx.context_builder.end_workflow(workflow_id, workflow_exec_id);
    }
}
