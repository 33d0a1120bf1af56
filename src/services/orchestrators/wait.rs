//! Wait task orchestrator.
//!
//! Parks the execution at creation time and leaves `waiting` only through a
//! valid signal (success) or a runtime-enforced timeout delivered as an
//! execution error (failed).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{Signal, TaskConfig, TaskState, TaskStatus, TaskType};
use crate::services::response::{ResponseHandler, ResponseOptions};

use super::{
    BaseOrchestrator, CreateStateInput, HandleResponseInput, OrchestratorContext, SignalHandler,
    TaskOrchestrator, TaskResponseEnvelope,
};

pub struct WaitOrchestrator {
    base: BaseOrchestrator,
}

impl WaitOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Wait) }
    }
}

#[async_trait]
impl TaskOrchestrator for WaitOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Wait
    }

    async fn prepare_execution(&self, input: &CreateStateInput) -> OrchResult<TaskConfig> {
        self.base.prepare(input).await
    }

    async fn create_state(&self, input: &CreateStateInput) -> OrchResult<TaskState> {
        self.base
            .create_state_with(input, |state| {
                // Wait tasks park immediately; there is nothing to run.
                let _ = state.transition_to(TaskStatus::Waiting);
            })
            .await
    }

    /// Signals never reach this directly: the adapter routes them through
    /// the [`SignalHandler`] capability, which validates (rejection leaves
    /// the state waiting, nothing persisted) and turns the payload into the
    /// output this flow then records. A response without a signal is a
    /// timeout or cancellation delivered by the runtime.
    async fn handle_response(
        &self,
        input: &HandleResponseInput,
    ) -> OrchResult<TaskResponseEnvelope> {
        ResponseHandler::new(self.base.ctx.clone())
            .handle(input, ResponseOptions::default())
            .await
    }

    fn as_signal_handler(&self) -> Option<&dyn SignalHandler> {
        Some(self)
    }
}

impl SignalHandler for WaitOrchestrator {
    fn validate_signal(&self, config: &TaskConfig, signal: &Signal) -> OrchResult<()> {
        validate_wait_signal(config, signal)
    }

    fn process_signal(&self, _state: &TaskState, signal: &Signal) -> OrchResult<Value> {
        Ok(signal_output(signal))
    }
}

/// Reject signals the wait config does not accept. Correlation ids are
/// enforced only when the config declares one.
fn validate_wait_signal(config: &TaskConfig, signal: &Signal) -> OrchResult<()> {
    let expected = config.wait_for.as_deref().unwrap_or_default();
    if signal.name != expected {
        return Err(OrchestrationError::SignalRejected(format!(
            "task {} waits for signal '{expected}', received '{}'",
            config.id, signal.name
        )));
    }
    if let Some(expected_correlation) = &config.correlation_id {
        let actual = signal.correlation_id.as_deref().unwrap_or_default();
        if actual != expected_correlation {
            return Err(OrchestrationError::SignalRejected(format!(
                "task {} requires correlation id '{expected_correlation}', received '{actual}'",
                config.id
            )));
        }
    }
    Ok(())
}

/// Output recorded on the state for an accepted signal.
fn signal_output(signal: &Signal) -> Value {
    json!({
        "signal": Value::Object(signal.payload.clone()),
        "signal_received_at": signal.timestamp.to_rfc3339(),
    })
}
