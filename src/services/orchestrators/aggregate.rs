//! Aggregate task orchestrator.
//!
//! Collects the outputs of the configured source tasks and combines them
//! under a strategy: shallow merge (last writer wins), per-key concat in
//! source order, or a named custom reducer registered with the context.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{AggregateStrategy, TaskConfig, TaskState, TaskType};
use crate::services::response::{ResponseHandler, ResponseOptions};

use super::{
    BaseOrchestrator, CreateStateInput, HandleResponseInput, OrchestratorContext, TaskOrchestrator,
    TaskResponseEnvelope,
};

/// A registered reducer: a pure function over the source outputs.
pub type Reducer = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Named reducers available to `custom`-strategy aggregate tasks.
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: RwLock<HashMap<String, Reducer>>,
}

impl ReducerRegistry {
    pub fn register<F>(&self, name: impl Into<String>, reducer: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let mut reducers = self.reducers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        reducers.insert(name.into(), Arc::new(reducer));
    }

    pub fn get(&self, name: &str) -> Option<Reducer> {
        let reducers = self.reducers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        reducers.get(name).cloned()
    }
}

pub struct AggregateOrchestrator {
    base: BaseOrchestrator,
}

impl AggregateOrchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { base: BaseOrchestrator::new(ctx, TaskType::Aggregate) }
    }

    /// Resolve each source reference to a concrete state's output, in
    /// declaration order. A missing source is a structured not-found.
    async fn collect_outputs(&self, input: &HandleResponseInput) -> OrchResult<Vec<Value>> {
        let states = self
            .base
            .ctx
            .states
            .list_states(&input.workflow_state.workflow_exec_id)
            .await?;

        let mut outputs = Vec::with_capacity(input.task_config.sources.len());
        for source in &input.task_config.sources {
            // States come ordered by exec id; the last execution of the
            // task id wins, deterministically.
            let state = states
                .iter()
                .filter(|s| s.task_id == *source)
                .next_back()
                .ok_or_else(|| OrchestrationError::state_not_found(source.clone()))?;
            outputs.push(state.output.clone().unwrap_or(Value::Null));
        }
        Ok(outputs)
    }

    fn combine(
        &self,
        config: &TaskConfig,
        outputs: &[Value],
    ) -> OrchResult<Value> {
        match config.aggregate_strategy() {
            AggregateStrategy::Merge => Ok(merge_outputs(&config.sources, outputs)),
            AggregateStrategy::Concat => Ok(concat_outputs(&config.sources, outputs)),
            AggregateStrategy::Custom => {
                let name = config.reducer.as_deref().ok_or_else(|| {
                    OrchestrationError::InvalidInput(format!(
                        "aggregate task {} uses the custom strategy without a reducer",
                        config.id
                    ))
                })?;
                let reducer = self.base.ctx.reducers.get(name).ok_or_else(|| {
                    OrchestrationError::InvalidInput(format!(
                        "aggregate task {} references unknown reducer '{name}'",
                        config.id
                    ))
                })?;
                Ok(reducer(outputs))
            }
        }
    }
}

#[async_trait]
impl TaskOrchestrator for AggregateOrchestrator {
    fn get_type(&self) -> TaskType {
        TaskType::Aggregate
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
        let handler = ResponseHandler::new(self.base.ctx.clone());
        if input.execution_error.is_some() {
            return handler.handle(input, ResponseOptions::default()).await;
        }

        let outputs = self.collect_outputs(input).await?;
        let combined = self.combine(&input.task_config, &outputs)?;

        let mut aggregated = input.clone();
        aggregated.output = Some(combined);
        handler.handle(&aggregated, ResponseOptions::default()).await
    }
}

/// Shallow merge by key; later sources win. A non-map output lands under
/// its source's task id.
fn merge_outputs(sources: &[String], outputs: &[Value]) -> Value {
    let mut merged = Map::new();
    for (source, output) in sources.iter().zip(outputs) {
        match output {
            Value::Object(map) => {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                merged.insert(source.clone(), other.clone());
            }
        }
    }
    Value::Object(merged)
}

/// `{key: [value, ...]}` in source order. A non-map output contributes to
/// the list under its source's task id.
fn concat_outputs(sources: &[String], outputs: &[Value]) -> Value {
    let mut concat: Map<String, Value> = Map::new();
    let mut push = |key: &str, value: &Value| match concat.get_mut(key) {
        Some(Value::Array(list)) => list.push(value.clone()),
        _ => {
            concat.insert(key.to_string(), Value::Array(vec![value.clone()]));
        }
    };
    for (source, output) in sources.iter().zip(outputs) {
        match output {
            Value::Object(map) => {
                for (key, value) in map {
                    push(key, value);
                }
            }
            Value::Null => {}
            other => push(source, other),
        }
    }
    Value::Object(concat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{i}")).collect()
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let outputs = vec![json!({"a": 1, "b": 1}), json!({"b": 2, "c": 2})];
        let merged = merge_outputs(&sources(2), &outputs);
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 2}));
    }

    #[test]
    fn test_merge_non_map_under_source_id() {
        let outputs = vec![json!({"a": 1}), json!("scalar")];
        let merged = merge_outputs(&sources(2), &outputs);
        assert_eq!(merged, json!({"a": 1, "s1": "scalar"}));
    }

    #[test]
    fn test_concat_preserves_source_order() {
        let outputs = vec![json!({"k": 1}), json!({"k": 2, "other": true}), json!({"k": 3})];
        let concat = concat_outputs(&sources(3), &outputs);
        assert_eq!(concat["k"], json!([1, 2, 3]));
        assert_eq!(concat["other"], json!([true]));
    }

    #[test]
    fn test_null_outputs_are_skipped() {
        let outputs = vec![json!(null), json!({"a": 1})];
        assert_eq!(merge_outputs(&sources(2), &outputs), json!({"a": 1}));
        assert_eq!(concat_outputs(&sources(2), &outputs), json!({"a": [1]}));
    }

    #[test]
    fn test_reducer_registry() {
        let registry = ReducerRegistry::default();
        registry.register("count", |outputs: &[Value]| json!({"count": outputs.len()}));

        let reducer = registry.get("count").unwrap();
        assert_eq!(reducer(&[json!(1), json!(2)]), json!({"count": 2}));
        assert!(registry.get("missing").is_none());
    }
}
