//! Shared fixtures for integration tests: an adapter over an in-memory
//! database and a minimal driver standing in for the durable runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use flowcore::adapters::sqlite::{open_in_memory, SqliteMetadataStore, SqliteStateRepository};
use flowcore::adapters::template::PathTemplateEngine;
use flowcore::domain::models::{
    TaskConfig, TaskErrorInfo, TaskState, WorkflowConfig, WorkflowState,
};
use flowcore::domain::ports::StateRepository;
use flowcore::services::{
    ActivityAdapter, CreateStateInput, HandleResponseInput, OrchestratorContext,
};

pub async fn setup_adapter() -> ActivityAdapter {
    let pool = open_in_memory().await.expect("failed to create test pool");
    let ctx = OrchestratorContext::new(
        Arc::new(SqliteStateRepository::new(pool.clone())),
        Arc::new(SqliteMetadataStore::new(pool)),
        Arc::new(PathTemplateEngine::new()),
    );
    ActivityAdapter::new(ctx)
}

pub fn create_input(
    workflow_state: &WorkflowState,
    workflow_config: &WorkflowConfig,
    task_config: &TaskConfig,
) -> CreateStateInput {
    CreateStateInput {
        workflow_state: workflow_state.clone(),
        workflow_config: workflow_config.clone(),
        task_config: task_config.clone(),
        parent_exec_id: None,
    }
}

pub fn response_input(input: &CreateStateInput, state: TaskState) -> HandleResponseInput {
    HandleResponseInput::new(
        input.workflow_state.clone(),
        input.workflow_config.clone(),
        input.task_config.clone(),
        state,
    )
}

/// Simulated executor: produces the output (or failure) of one leaf task.
pub type Executor = dyn Fn(&TaskConfig, &TaskState) -> Result<Value, TaskErrorInfo> + Send + Sync;

/// Stand-in for the durable runtime: creates states, materializes child
/// cycles, and feeds executor results back through the adapter. Wait tasks
/// are not driven here; signal delivery is test-specific.
pub struct TestRuntime {
    pub adapter: ActivityAdapter,
}

impl TestRuntime {
    pub fn new(adapter: ActivityAdapter) -> Self {
        Self { adapter }
    }

    pub fn states(&self) -> &Arc<dyn StateRepository> {
        &self.adapter.context().states
    }

    /// Create and run one task (and its descendants) to completion.
    pub async fn execute(&self, input: &CreateStateInput, executor: &Executor) -> TaskState {
        let state = self.adapter.create_task_state(input).await.expect("failed to create state");
        self.drive(input, &state, executor).await;
        self.states().get_state(&state.exec_id).await.expect("root state vanished")
    }

    fn drive<'a>(
        &'a self,
        input: &'a CreateStateInput,
        state: &'a TaskState,
        executor: &'a Executor,
    ) -> Pin<Box<dyn Future<Output = ()> + 'a>> {
        Box::pin(async move {
            if state.execution_type.is_child_bearing() {
                loop {
                    let created = self
                        .adapter
                        .create_child_states(input, &state.exec_id)
                        .await
                        .expect("failed to create children");
                    if created.is_empty() {
                        break;
                    }
                    for child in &created {
                        let child_input = CreateStateInput {
                            workflow_state: input.workflow_state.clone(),
                            workflow_config: input.workflow_config.clone(),
                            task_config: child.task_config.clone(),
                            parent_exec_id: Some(state.exec_id.clone()),
                        };
                        self.drive(&child_input, &child.state, executor).await;
                    }
                    let fresh = self
                        .states()
                        .get_state(&state.exec_id)
                        .await
                        .expect("parent state vanished");
                    if fresh.is_terminal() {
                        break;
                    }
                }

                // Once terminal, the parent is re-enqueued for its own
                // response handling, which propagates to its parent in turn.
                let fresh = self
                    .states()
                    .get_state(&state.exec_id)
                    .await
                    .expect("parent state vanished");
                if fresh.is_terminal() {
                    let response = response_input(input, fresh);
                    let _ = self.adapter.handle_task_response(&response).await;
                }
            } else {
                // Canceled siblings are not executed.
                let fresh = self
                    .states()
                    .get_state(&state.exec_id)
                    .await
                    .expect("child state vanished");
                if fresh.is_terminal() {
                    return;
                }

                let mut response = response_input(input, fresh);
                match executor(&input.task_config, state) {
                    Ok(output) => response.output = Some(output),
                    Err(error) => response.execution_error = Some(error),
                }
                // A failure without an error transition surfaces after the
                // state is persisted; the driver tolerates it.
                let _ = self.adapter.handle_task_response(&response).await;
            }
        })
    }
}
