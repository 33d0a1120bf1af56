//! Collection task orchestrator.
//!
//! Expands an item source into one child per retained item: resolve the
//! source, filter with `item`/`index` in scope, clone the child template
//! per item, and create children in batches when a batch size is declared.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskConfig, TaskState, TaskStatus, TaskType};
use crate::domain::ports::{is_truthy, MetadataStoreExt};
use crate::services::aggregator;
use crate::services::context::NormalizationContext;

use super::{
    children_key, BaseOrchestrator, ChildStatusAggregator, ChildTaskManager, ChildrenMetadata,
    CreateStateInput, CreatedChild, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

pub struct CollectionOrchestrator {
    base: BaseOrchestrator,
}

impl CollectionOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Collection) }
    }

    /// Expand the configured item source into a concrete sequence.
    ///
    /// Inline lists pass through; strings are evaluated as expressions
    /// (template references resolved during normalization already became
    /// values).
    fn expand_items(&self, config: &TaskConfig, ctx: &NormalizationContext) -> OrchResult<Vec<Value>> {
        match &config.items {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::String(expr)) => {
                let value = self.base.ctx.engine.evaluate(expr, &ctx.variables)?;
                match value {
                    Value::Array(items) => Ok(items),
                    Value::Null => Ok(Vec::new()),
                    other => Err(OrchestrationError::InvalidInput(format!(
                        "collection task {} item source produced {other} instead of a sequence",
                        config.id
                    ))),
                }
            }
            Some(other) => Err(OrchestrationError::InvalidInput(format!(
                "collection task {} item source produced {other} instead of a sequence",
                config.id
            ))),
        }
    }

    /// Retain items whose filter expression evaluates truthy, with the item
    /// and its original index bound.
    fn filter_items(
        &self,
        config: &TaskConfig,
        ctx: &NormalizationContext,
        items: Vec<Value>,
    ) -> OrchResult<Vec<Value>> {
        let Some(filter) = &config.filter else {
            return Ok(items);
        };
        let mut retained = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut scoped = ctx.clone();
            scoped.with_item(item.clone(), index, config.item_var_name(), config.index_var_name());
            let verdict = self.base.ctx.engine.evaluate(filter, &scoped.variables)?;
            if is_truthy(&verdict) {
                retained.push(item);
            }
        }
        Ok(retained)
    }

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
impl TaskOrchestrator for CollectionOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Collection
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
impl ChildTaskManager for CollectionOrchestrator {
    async fn prepare_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<ChildrenMetadata> {
        let config = self.base.prepare(input).await?;
        let template = config.task.as_deref().ok_or_else(|| {
            OrchestrationError::InvalidInput(format!(
                "collection task {} declares no child template",
                config.id
            ))
        })?;
        let base_ctx = self
            .base
            .normalization_context(
                &input.workflow_state,
                &input.workflow_config,
                &input.task_config,
                Some(parent),
            )
            .await?;

        let items = self.expand_items(&config, &base_ctx)?;
        let original_count = items.len();
        let retained = self.filter_items(&config, &base_ctx, items)?;
        let filtered_count = retained.len();

        let mut child_configs = Vec::with_capacity(filtered_count);
        for (index, item) in retained.into_iter().enumerate() {
            let mut scoped =
                self.base.ctx.context_builder.sub_context(&base_ctx, template, &config, Some(parent));
            scoped.with_item(item.clone(), index, config.item_var_name(), config.index_var_name());
            let mut child = self.base.ctx.normalizer.normalize(template, &scoped)?;
            child.id = format!("{}-{index}", template.id);
            // The bindings also land in the child's input, so descendants
            // of the child still reach them (via parent.input) after the
            // prepare-time scope is gone.
            let with = child.with.get_or_insert_with(serde_json::Map::new);
            with.insert(config.item_var_name().to_string(), item);
            with.insert(config.index_var_name().to_string(), Value::Number(index.into()));
            child_configs.push(child);
        }

        let meta = ChildrenMetadata {
            count: filtered_count,
            child_configs,
            strategy: config.strategy.clone(),
            batch_size: config.batch,
            item_source: config.items.as_ref().map(ToString::to_string),
            original_count: Some(original_count),
            filtered_count: Some(filtered_count),
            ..ChildrenMetadata::default()
        };
        self.base.ctx.metadata.store_as(&children_key(&parent.exec_id), &meta).await?;
        tracing::debug!(
            parent_exec_id = %parent.exec_id,
            original_count,
            filtered_count,
            "Prepared collection children"
        );
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

        let remaining = meta.count - meta.created;
        let cycle = match meta.batch_size {
            Some(batch) if batch > 0 => batch.min(remaining),
            _ => remaining,
        };

        let mut created = Vec::with_capacity(cycle);
        for child_config in &meta.child_configs[meta.created..meta.created + cycle] {
            created.push(self.base.spawn_child(input, child_config, parent).await?);
        }
        meta.created += cycle;
        self.base.ctx.metadata.store_as(&key, &meta).await?;

        tracing::debug!(
            parent_exec_id = %parent.exec_id,
            created = created.len(),
            cursor = meta.created,
            total = meta.count,
            "Created collection batch"
        );
        Ok(created)
    }

    async fn children_metadata(&self, parent_exec_id: &str) -> OrchResult<Option<ChildrenMetadata>> {
        self.base.ctx.metadata.load_as(&children_key(parent_exec_id)).await
    }
}

#[async_trait]
impl ChildStatusAggregator for CollectionOrchestrator {
    async fn calculate_status(&self, parent: &TaskState) -> OrchResult<TaskStatus> {
        let meta = self.children_metadata(&parent.exec_id).await?;
        // Collections may declare a parallel-style strategy; wait_all is
        // the default. A zero-item source aggregates straight to success.
        let strategy = meta
            .as_ref()
            .and_then(|m| m.strategy.as_deref())
            .and_then(crate::domain::models::ParallelStrategy::from_str)
            .unwrap_or_default();
        let statuses = self.child_statuses(&parent.exec_id, meta.as_ref()).await?;
        Ok(aggregator::aggregate(&statuses, strategy))
    }
}
