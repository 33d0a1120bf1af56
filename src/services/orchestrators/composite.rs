//! Composite task orchestrator.
//!
//! A sequential pipeline: one child at a time. When a step completes, its
//! output is injected into the next step's context as `previous.output` and
//! the cursor advances. A failed step fails the pipeline unless
//! `error_on_fail` is disabled, in which case the sequence continues with
//! `previous` unchanged.

use async_trait::async_trait;
use serde_json::json;

use crate::domain::errors::OrchResult;
use crate::domain::models::{TaskConfig, TaskState, TaskStatus, TaskType};
use crate::domain::ports::MetadataStoreExt;

use super::{
    children_key, BaseOrchestrator, ChildStatusAggregator, ChildTaskManager, ChildrenMetadata,
    CreateStateInput, CreatedChild, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct CompositeOrchestrator {
    base: BaseOrchestrator,
}

impl CompositeOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Composite) }
    }
}

#[async_trait]
impl TaskOrchestrator for CompositeOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Composite
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
        super::handle_parent_response(&self.base, self, input).await
    }

    fn as_child_manager(&self) -> Option<&dyn ChildTaskManager> {
        Some(self)
    }

    fn as_status_aggregator(&self) -> Option<&dyn ChildStatusAggregator> {
        Some(self)
    }
}

#[async_trait]
impl ChildTaskManager for CompositeOrchestrator {
    async fn prepare_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<ChildrenMetadata> {
        let config = self.base.prepare(input).await?;

        // Steps stay templated here; each one is normalized at creation
        // time, when the previous step's output exists.
        let meta = ChildrenMetadata {
            count: config.tasks.len(),
            child_configs: config.tasks.clone(),
            current_step: Some(0),
            error_on_fail: Some(config.fails_on_step_error()),
            ..ChildrenMetadata::default()
        };
        self.base.ctx.metadata.store_as(&children_key(&parent.exec_id), &meta).await?;
        Ok(meta)
    }

    async fn create_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<Vec<CreatedChild>> {
        let key = children_key(&parent.exec_id);
        let loaded = self.base.ctx.metadata.load_as::<ChildrenMetadata>(&key).await?;
        let Some(mut meta) = loaded else {
            return Ok(Vec::new());
        };

        let step = meta.current_step.unwrap_or(0);
        if step >= meta.count || meta.created > step {
            // Pipeline exhausted, or the current step's child already exists.
            return Ok(Vec::new());
        }

        let step_config = meta.child_configs[step].clone();
        let base_ctx = self
            .base
            .normalization_context(
                &input.workflow_state,
                &input.workflow_config,
                &input.task_config,
                Some(parent),
            )
            .await?;
        let mut scoped = self.base.ctx.context_builder.sub_context(
            &base_ctx,
            &step_config,
            &input.task_config,
            Some(parent),
        );
        if let Some(previous) = &meta.previous_output {
            scoped
                .variables
                .insert("previous".to_string(), json!({ "output": previous }));
        }
        let normalized = self.base.ctx.normalizer.normalize(&step_config, &scoped)?;

        let created = self.base.spawn_child(input, &normalized, parent).await?;
        meta.created = step + 1;
        self.base.ctx.metadata.store_as(&key, &meta).await?;

        tracing::debug!(
            parent_exec_id = %parent.exec_id,
            step,
            task_id = %normalized.id,
            "Created composite step"
        );
        Ok(vec![created])
    }

    async fn children_metadata(&self, parent_exec_id: &str) -> OrchResult<Option<ChildrenMetadata>> {
        self.base.ctx.metadata.load_as(&children_key(parent_exec_id)).await
    }

    /// Advance the cursor when a step finishes, recording its output for
    /// the next step's `previous.output`. A tolerated failure advances with
    /// `previous` unchanged.
    async fn on_child_terminal(
        &self,
        _input: &HandleResponseInput,
        parent: &TaskState,
        child: &TaskState,
    ) -> OrchResult<()> {
        let key = children_key(&parent.exec_id);
        let loaded = self.base.ctx.metadata.load_as::<ChildrenMetadata>(&key).await?;
        let Some(mut meta) = loaded else {
            return Ok(());
        };
        let step = meta.current_step.unwrap_or(0);
        if step >= meta.count {
            return Ok(());
        }

        match child.status {
            TaskStatus::Success => {
                meta.current_step = Some(step + 1);
                meta.previous_output.clone_from(&child.output);
                // The pipeline's own output tracks the last completed step.
                let last_output = child.output.clone();
                self.base
                    .ctx
                    .transactions
                    .apply_transformation(&parent.exec_id, move |p| {
                        p.output = last_output;
                        Ok(())
                    })
                    .await?;
            }
            TaskStatus::Failed if !meta.error_on_fail.unwrap_or(true) => {
                meta.current_step = Some(step + 1);
            }
            _ => return Ok(()),
        }
        self.base.ctx.metadata.store_as(&key, &meta).await?;
        Ok(())
    }
}

#[async_trait]
impl ChildStatusAggregator for CompositeOrchestrator {
    async fn calculate_status(&self, parent: &TaskState) -> OrchResult<TaskStatus> {
        let Some(meta) = self.children_metadata(&parent.exec_id).await? else {
            return Ok(parent.status);
        };
        if meta.count == 0 {
            return Ok(TaskStatus::Success);
        }

        let children = self.base.ctx.states.list_children(&parent.exec_id).await?;
        let error_on_fail = meta.error_on_fail.unwrap_or(true);
        if error_on_fail && children.iter().any(|c| c.status == TaskStatus::Failed) {
            return Ok(TaskStatus::Failed);
        }
        if children.iter().any(|c| c.status == TaskStatus::Canceled) {
            return Ok(TaskStatus::Canceled);
        }

        let step = meta.current_step.unwrap_or(0);
        if step >= meta.count && children.iter().all(TaskState::is_terminal) {
            return Ok(TaskStatus::Success);
        }
        Ok(TaskStatus::Running)
    }
}
