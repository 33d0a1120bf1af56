//! Configuration normalization.
//!
//! Replaces templated fields of a task config with concrete values from the
//! normalization context. Fields that must resolve lazily (child configs,
//! per-item filters, output transformations) are deferred verbatim and
//! resolved by their orchestrator when their variables exist.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskConfig, TaskType, TransitionConfig};
use crate::domain::ports::TemplateEngine;
use crate::services::context::NormalizationContext;
use crate::services::limits;

/// Keys every task type defers: executor bindings and output
/// transformations, which only make sense after execution.
const BASE_DEFERRED: &[&str] = &["agent", "tool", "outputs", "output"];

/// Orchestrator-declared additions to the deferred set.
fn deferred_keys(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        // Child configs resolve against sub-contexts at preparation time
        TaskType::Parallel | TaskType::Composite => &["tasks"],
        // The template and filter wait for item/index bindings
        TaskType::Collection => &["task", "filter"],
        // Route conditions evaluate against the task output on response
        TaskType::Router => &["routes"],
        _ => &[],
    }
}

/// Applies template evaluation to task configs using a built context.
pub struct ConfigNormalizer {
    engine: Arc<dyn TemplateEngine>,
}

impl ConfigNormalizer {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self { engine }
    }

    /// Normalize `config` for an orchestrator handling `expected`.
    ///
    /// The basic normalizer additionally accepts `memory` configs (they
    /// execute as basic tasks at this boundary).
    pub fn normalize_as(
        &self,
        expected: TaskType,
        config: &TaskConfig,
        ctx: &NormalizationContext,
    ) -> OrchResult<TaskConfig> {
        let accepted = expected == config.task_type
            || (expected == TaskType::Basic && config.task_type == TaskType::Memory);
        if !accepted {
            return Err(OrchestrationError::InvalidInput(format!(
                "{} normalizer received a {} task config ({})",
                expected.as_str(),
                config.task_type.as_str(),
                config.id
            )));
        }
        self.normalize(config, ctx)
    }

    /// Normalize `config` against `ctx`, deferring per-type lazy fields.
    pub fn normalize(
        &self,
        config: &TaskConfig,
        ctx: &NormalizationContext,
    ) -> OrchResult<TaskConfig> {
        let original_with = config.with.clone();

        let Value::Object(map) = serde_json::to_value(config)? else {
            return Err(OrchestrationError::Serialization(
                "task config did not serialize to a map".to_string(),
            ));
        };

        let extra = deferred_keys(config.task_type);
        let deferred = |key: &str| BASE_DEFERRED.contains(&key) || extra.contains(&key);
        let parsed = self
            .engine
            .parse_map_with_filter(&map, &ctx.variables, &deferred)
            .map_err(|e| OrchestrationError::TemplateEvaluation {
                task_type: config.task_type.as_str().to_string(),
                message: e.to_string(),
            })?;

        let mut normalized: TaskConfig = serde_json::from_value(Value::Object(parsed))?;

        // Restore `with`: parsed values overlay the original so unresolved
        // keys a concurrent writer relies on are never lost.
        normalized.with = match (original_with, normalized.with.take()) {
            (Some(original), Some(parsed)) => {
                let mut merged = original;
                merged.extend(parsed);
                Some(merged)
            }
            (Some(original), None) => Some(original),
            (None, parsed) => parsed,
        };

        enforce_string_limit(&normalized)?;
        Ok(normalized)
    }

    /// Normalize a transition's map form.
    ///
    /// When the context lacks a current input and the transition carries
    /// `with`, the transition's own `with` is adopted as the current input
    /// first, so templates inside the transition body see their inputs.
    pub fn normalize_transition(
        &self,
        transition: &TransitionConfig,
        ctx: &NormalizationContext,
    ) -> OrchResult<TransitionConfig> {
        let mut scoped;
        let ctx = if ctx.current_input.is_none() && transition.with.is_some() {
            scoped = ctx.clone();
            if let Some(with) = &transition.with {
                scoped.set_current_input(with.clone());
            }
            &scoped
        } else {
            ctx
        };

        let value = serde_json::to_value(transition)?;
        let parsed = self.engine.parse_any(&value, &ctx.variables).map_err(|e| {
            OrchestrationError::TemplateEvaluation {
                task_type: "transition".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(serde_json::from_value(parsed)?)
    }
}

/// Reject rendered `with` strings beyond the configured bound.
fn enforce_string_limit(config: &TaskConfig) -> OrchResult<()> {
    let max = limits::get().max_string_length;
    if let Some(with) = &config.with {
        for (key, value) in with {
            if let Value::String(s) = value {
                if s.len() > max {
                    return Err(OrchestrationError::TemplateEvaluation {
                        task_type: config.task_type.as_str().to_string(),
                        message: format!(
                            "rendered value for '{key}' exceeds maximum string length ({max})"
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}
