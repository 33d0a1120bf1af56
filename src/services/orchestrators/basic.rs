//! Basic task orchestrator.
//!
//! No children, no signals: normalize, persist, and hand the executor's
//! output back verbatim on success. Output-error detection and transition
//! handling come from the shared response flow. `memory` configs run
//! through this orchestrator unchanged.

use async_trait::async_trait;

use crate::domain::errors::OrchResult;
use crate::domain::models::{TaskConfig, TaskState, TaskType};
use crate::services::response::{ResponseHandler, ResponseOptions};

use super::{
    BaseOrchestrator, CreateStateInput, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct BasicOrchestrator {
    base: BaseOrchestrator,
}

impl BasicOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Basic) }
    }
}

#[async_trait]
impl TaskOrchestrator for BasicOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Basic
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
        ResponseHandler::new(self.base.ctx.clone())
            .handle(input, ResponseOptions::default())
            .await
    }
}
