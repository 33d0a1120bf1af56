//! Signal task orchestrator.
//!
//! Dispatches a named signal to the configured targets through the
//! [`SignalDispatcher`] boundary. Per-target results land in the output; a
//! single delivery failure only fails the task when `fail_on_error` says so.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{Signal, TaskConfig, TaskErrorInfo, TaskState, TaskType};
use crate::domain::ports::SignalDispatcher;
use crate::services::response::{ResponseHandler, ResponseOptions};

use super::{
    BaseOrchestrator, CreateStateInput, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct SignalOrchestrator {
    base: BaseOrchestrator,
}

impl SignalOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Signal) }
    }

    /// Deliver to every target, collecting per-target results in config
    /// order. Delivery errors are recorded, not propagated.
    async fn dispatch_all(
        &self,
        config: &TaskConfig,
        signal: &Signal,
        dispatcher: Option<&dyn SignalDispatcher>,
    ) -> Vec<Value> {
        let mut results = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            let outcome = match dispatcher {
                Some(dispatcher) => dispatcher.dispatch(target, signal).await,
                None => Err(OrchestrationError::InvalidInput(
                    "no signal dispatcher configured".to_string(),
                )),
            };
            match outcome {
                Ok(()) => results.push(json!({"target": target, "ok": true})),
                Err(err) => {
                    tracing::warn!(
                        target = %target,
                        signal = %signal.name,
                        error = %err,
                        "Signal dispatch failed"
                    );
                    results.push(json!({"target": target, "ok": false, "error": err.to_string()}));
                }
            }
        }
        results
    }
}

#[async_trait]
impl TaskOrchestrator for SignalOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Signal
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
        let config = &input.task_config;

        // The payload was template-resolved into the state input at
        // creation; the action string names the dispatched signal.
        let mut signal = Signal::new(config.action.clone());
        if let Some(payload) = &input.state.input {
            signal = signal.with_payload(payload.clone());
        }

        let dispatcher = self.base.ctx.dispatcher.as_deref();
        let results = self.dispatch_all(config, &signal, dispatcher).await;
        let delivered = results.iter().filter(|r| r["ok"] == json!(true)).count();
        let failed = results.len() - delivered;

        let mut dispatched = input.clone();
        dispatched.output = Some(json!({
            "signal": signal.name,
            "results": results,
            "delivered": delivered,
        }));
        if failed > 0 && config.fail_on_error.unwrap_or(false) {
            dispatched.execution_error = Some(TaskErrorInfo::new(format!(
                "signal dispatch failed for {failed} target(s)"
            )));
        }

        ResponseHandler::new(self.base.ctx.clone())
            .handle(&dispatched, ResponseOptions::default())
            .await
    }
}
