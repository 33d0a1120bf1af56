//! Orchestrator factory.
//!
//! The only place that enumerates the task-type set. Everything else
//! dispatches through the [`TaskOrchestrator`] contract obtained here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::TaskType;
use crate::services::orchestrators::{
    AggregateOrchestrator, BasicOrchestrator, CollectionOrchestrator, CompositeOrchestrator,
    OrchestratorContext, ParallelOrchestrator, RouterOrchestrator, SignalOrchestrator,
    TaskOrchestrator, WaitOrchestrator,
};

/// Constructors are pure: all dependencies come from the injected context.
pub type OrchestratorConstructor =
    Arc<dyn Fn(&OrchestratorContext) -> Arc<dyn TaskOrchestrator> + Send + Sync>;

/// Thread-safe registry mapping task type tags to constructors.
pub struct OrchestratorFactory {
    constructors: RwLock<HashMap<TaskType, OrchestratorConstructor>>,
}

impl Default for OrchestratorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorFactory {
    /// Empty registry.
    pub fn new() -> Self {
        Self { constructors: RwLock::new(HashMap::new()) }
    }

    /// Registry with the built-in orchestrator set. `memory` configs run
    /// through the basic orchestrator.
    pub fn with_builtins() -> Self {
        let factory = Self::new();
        factory.register(TaskType::Basic, |ctx| Arc::new(BasicOrchestrator::new(ctx.clone())));
        factory.register(TaskType::Memory, |ctx| Arc::new(BasicOrchestrator::new(ctx.clone())));
        factory
            .register(TaskType::Parallel, |ctx| Arc::new(ParallelOrchestrator::new(ctx.clone())));
        factory.register(TaskType::Collection, |ctx| {
            Arc::new(CollectionOrchestrator::new(ctx.clone()))
        });
        factory.register(TaskType::Composite, |ctx| {
            Arc::new(CompositeOrchestrator::new(ctx.clone()))
        });
        factory.register(TaskType::Router, |ctx| Arc::new(RouterOrchestrator::new(ctx.clone())));
        factory.register(TaskType::Aggregate, |ctx| {
            Arc::new(AggregateOrchestrator::new(ctx.clone()))
        });
        factory.register(TaskType::Wait, |ctx| Arc::new(WaitOrchestrator::new(ctx.clone())));
        factory.register(TaskType::Signal, |ctx| Arc::new(SignalOrchestrator::new(ctx.clone())));
        factory
    }

    /// Register (or replace) the constructor for a task type.
    pub fn register<F>(&self, task_type: TaskType, constructor: F)
    where
        F: Fn(&OrchestratorContext) -> Arc<dyn TaskOrchestrator> + Send + Sync + 'static,
    {
        let mut constructors = self
            .constructors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        constructors.insert(task_type, Arc::new(constructor));
    }

    /// Create the orchestrator for a task type.
    pub fn create(
        &self,
        task_type: TaskType,
        ctx: &OrchestratorContext,
    ) -> OrchResult<Arc<dyn TaskOrchestrator>> {
        let constructor = {
            let constructors = self
                .constructors
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            constructors.get(&task_type).cloned()
        };
        constructor
            .map(|c| c(ctx))
            .ok_or_else(|| OrchestrationError::UnknownTaskType(task_type.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{open_in_memory, SqliteMetadataStore, SqliteStateRepository};
    use crate::adapters::template::PathTemplateEngine;

    async fn context() -> OrchestratorContext {
        let pool = open_in_memory().await.unwrap();
        OrchestratorContext::new(
            Arc::new(SqliteStateRepository::new(pool.clone())),
            Arc::new(SqliteMetadataStore::new(pool)),
            Arc::new(PathTemplateEngine::new()),
        )
    }

    #[tokio::test]
    async fn test_builtins_cover_every_type() {
        let ctx = context().await;
        let factory = OrchestratorFactory::with_builtins();
        for ty in [
            TaskType::Basic,
            TaskType::Parallel,
            TaskType::Collection,
            TaskType::Composite,
            TaskType::Router,
            TaskType::Aggregate,
            TaskType::Wait,
            TaskType::Signal,
            TaskType::Memory,
        ] {
            let orchestrator = factory.create(ty, &ctx).unwrap();
            // Memory executes through the basic orchestrator
            let expected = if ty == TaskType::Memory { TaskType::Basic } else { ty };
            assert_eq!(orchestrator.get_type(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_type_without_registration() {
        let ctx = context().await;
        let factory = OrchestratorFactory::new();
        let err = match factory.create(TaskType::Basic, &ctx) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, OrchestrationError::UnknownTaskType(_)));
    }

    #[tokio::test]
    async fn test_registration_replaces() {
        let ctx = context().await;
        let factory = OrchestratorFactory::with_builtins();
        // Replace basic with the wait orchestrator to prove replacement
        factory.register(TaskType::Basic, |ctx| Arc::new(WaitOrchestrator::new(ctx.clone())));
        let orchestrator = factory.create(TaskType::Basic, &ctx).unwrap();
        assert_eq!(orchestrator.get_type(), TaskType::Wait);
    }
}
