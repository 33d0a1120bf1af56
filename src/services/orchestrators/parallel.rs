//! Parallel task orchestrator.
//!
//! Materializes the declared children exactly as written, creates their
//! states in one shot, and derives its own status from theirs under the
//! configured strategy. Output transformation is deferred until every child
//! is terminal.

use async_trait::async_trait;

use crate::domain::errors::OrchResult;
use crate::domain::models::{ParallelStrategy, TaskConfig, TaskState, TaskStatus, TaskType};
use crate::domain::ports::MetadataStoreExt;
use crate::services::aggregator;

use super::{
    children_key, BaseOrchestrator, ChildStatusAggregator, ChildTaskManager, ChildrenMetadata,
    CreateStateInput, CreatedChild, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct ParallelOrchestrator {
    base: BaseOrchestrator,
}

impl ParallelOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Parallel) }
    }

    /// Children statuses padded with `pending` placeholders for entries the
    /// batch cursor has not created yet, so a half-created parent never
    /// aggregates as complete.
    async fn child_statuses(
        &self,
        parent_exec_id: &str,
        meta: Option<&ChildrenMetadata>,
    ) -> OrchResult<Vec<TaskStatus>> {
        let children = self.base.ctx.states.list_children(parent_exec_id).await?;
        let mut statuses: Vec<TaskStatus> = children.iter().map(|c| c.status).collect();
        if let Some(meta) = meta {
            while statuses.len() < meta.count {
                statuses.push(TaskStatus::Pending);
            }
        }
        Ok(statuses)
    }
}

#[async_trait]
impl TaskOrchestrator for ParallelOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Parallel
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
impl ChildTaskManager for ParallelOrchestrator {
    async fn prepare_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<ChildrenMetadata> {
        let config = self.base.prepare(input).await?;
        let base_ctx = self
            .base
            .normalization_context(
                &input.workflow_state,
                &input.workflow_config,
                &input.task_config,
                Some(parent),
            )
            .await?;

        let mut child_configs = Vec::with_capacity(config.tasks.len());
        for (index, child) in config.tasks.iter().enumerate() {
            let sub =
                self.base.ctx.context_builder.sub_context(&base_ctx, child, &config, Some(parent));
            let mut normalized = self.base.ctx.normalizer.normalize(child, &sub)?;
            // Index suffix disambiguates the children in variable maps.
            normalized.id = format!("{}-{index}", child.id);
            child_configs.push(normalized);
        }

        let meta = ChildrenMetadata {
            count: child_configs.len(),
            child_configs,
            strategy: Some(config.parallel_strategy().as_str().to_string()),
            max_workers: config.max_workers,
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
        if meta.created >= meta.count {
            return Ok(Vec::new());
        }

        // Parallel children materialize in one shot; max_workers bounds the
        // runtime's scheduling, not creation.
        let mut created = Vec::with_capacity(meta.count - meta.created);
        for child_config in &meta.child_configs[meta.created..] {
            created.push(self.base.spawn_child(input, child_config, parent).await?);
        }
        meta.created = meta.count;
        self.base.ctx.metadata.store_as(&key, &meta).await?;

        tracing::debug!(
            parent_exec_id = %parent.exec_id,
            count = created.len(),
            "Created parallel children"
        );
        Ok(created)
    }

    async fn children_metadata(&self, parent_exec_id: &str) -> OrchResult<Option<ChildrenMetadata>> {
        self.base.ctx.metadata.load_as(&children_key(parent_exec_id)).await
    }

    async fn on_child_terminal(
        &self,
        _input: &HandleResponseInput,
        parent: &TaskState,
        child: &TaskState,
    ) -> OrchResult<()> {
        let meta = self.children_metadata(&parent.exec_id).await?;
        let strategy = meta
            .as_ref()
            .and_then(|m| m.strategy.as_deref())
            .and_then(ParallelStrategy::from_str)
            .unwrap_or_default();

        let decided = match strategy {
            ParallelStrategy::FailFast => child.status == TaskStatus::Failed,
            ParallelStrategy::Race => child.status != TaskStatus::Canceled,
            _ => false,
        };
        if decided {
            self.base.cancel_siblings(&parent.exec_id, &child.exec_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChildStatusAggregator for ParallelOrchestrator {
    async fn calculate_status(&self, parent: &TaskState) -> OrchResult<TaskStatus> {
        let meta = self.children_metadata(&parent.exec_id).await?;
        let strategy = meta
            .as_ref()
            .and_then(|m| m.strategy.as_deref())
            .and_then(ParallelStrategy::from_str)
            .unwrap_or_default();
        let statuses = self.child_statuses(&parent.exec_id, meta.as_ref()).await?;
        Ok(aggregator::aggregate(&statuses, strategy))
    }
}
