//! Router task orchestrator.
//!
//! Evaluates route conditions in declaration order against the task output;
//! the first truthy route wins, the configured default catches the rest,
//! and a router with neither fails the task.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskConfig, TaskState, TaskType};
use crate::domain::ports::is_truthy;
use crate::services::response::{ResponseHandler, ResponseOptions};

use super::{
    BaseOrchestrator, CreateStateInput, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct RouterOrchestrator {
    base: BaseOrchestrator,
}

/// Outcome of route selection.
struct SelectedRoute {
    /// The condition that matched, or `"default"`.
    condition: String,
    next_task: String,
}

impl RouterOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Router) }
    }

    async fn select_route(
        &self,
        input: &HandleResponseInput,
        output: Option<&Value>,
    ) -> OrchResult<SelectedRoute> {
        let config = &input.task_config;
        let ctx = self
            .base
            .normalization_context(
                &input.workflow_state,
                &input.workflow_config,
                config,
                Some(&input.state),
            )
            .await?;
        let mut variables = ctx.variables;
        variables.insert("output".to_string(), output.cloned().unwrap_or(Value::Null));

        for route in &config.routes {
            let value = self.base.ctx.engine.evaluate(&route.when, &variables)?;
            if is_truthy(&value) {
                return Ok(SelectedRoute {
                    condition: route.when.clone(),
                    next_task: route.next.clone(),
                });
            }
        }
        if let Some(default) = &config.default_route {
            return Ok(SelectedRoute {
                condition: "default".to_string(),
                next_task: default.clone(),
            });
        }
        Err(OrchestrationError::NoRoute { task_id: config.id.clone() })
    }
}

#[async_trait]
impl TaskOrchestrator for RouterOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Router
    }

    async fn prepare_execution(&self, input: &CreateStateInput) -> OrchResult<TaskConfig> {
        self.base.prepare(input).await
    }

    async fn create_state(&self, input: &CreateStateInput) -> OrchResult<TaskState> {
        self.base.create_state_with(input, |_| {}).await
    }

    async fn handle_response(
        &self,
        input: &HandleResponseInput,
    ) -> OrchResult<TaskResponseEnvelope> {
        let output = input.output.as_ref().or(input.state.output.as_ref());

        // Execution failures skip selection; the shared flow walks on_error.
        if input.execution_error.is_some() {
            return ResponseHandler::new(self.base.ctx.clone())
                .handle(input, ResponseOptions::default())
                .await;
        }

        let selected = self.select_route(input, output).await?;

        // Augment the output with the selection before persisting.
        let mut augmented = match output {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
            None => Map::new(),
        };
        augmented.insert("selected_route".to_string(), Value::String(selected.condition));
        augmented.insert("next_task".to_string(), Value::String(selected.next_task.clone()));

        let mut routed = input.clone();
        routed.output = Some(Value::Object(augmented));

        ResponseHandler::new(self.base.ctx.clone())
            .handle(&routed, ResponseOptions { next_override: Some(selected.next_task) })
            .await
    }
}
