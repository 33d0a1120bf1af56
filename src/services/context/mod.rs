//! Normalization context construction.
//!
//! Builds the variable map a template evaluates against: `workflow`,
//! `tasks`, `task`, `parent`, `current`, plus `item`/`index` for collection
//! children and `state` when the caller has the live state in hand.
//! Enumeration is deterministic (children sort by exec-id string, tasks by
//! task id) so replay produces identical variable maps.

pub mod parent;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskConfig, TaskState, WorkflowConfig, WorkflowState};
use crate::domain::ports::VariableMap;
use crate::services::limits::{self, ConfigLimits};

pub use parent::{ParentContextCache, CHILDREN_CYCLE_ERROR, PARENT_CYCLE_ERROR};
use parent::{build_parent_context, parent_frame, ParentLookup};

/// Ephemeral product of one normalization call.
#[derive(Debug, Clone)]
pub struct NormalizationContext {
    pub workflow_state: WorkflowState,
    pub workflow_config: WorkflowConfig,
    pub task_config: TaskConfig,
    /// Every config in the workflow tree, keyed by task id.
    pub task_configs: BTreeMap<String, TaskConfig>,
    pub current_input: Option<Map<String, Value>>,
    /// Parent exec id → ordered child exec ids.
    pub children_index: BTreeMap<String, Vec<String>>,
    /// The map templates evaluate against.
    pub variables: VariableMap,
}

impl NormalizationContext {
    /// Replace the current input (`current.input` in the variable map).
    pub fn set_current_input(&mut self, input: Map<String, Value>) {
        if let Some(Value::Object(current)) = self.variables.get_mut("current") {
            current.insert("input".to_string(), Value::Object(input.clone()));
        }
        self.current_input = Some(input);
    }

    /// Bind a collection item under the declared variable names.
    pub fn with_item(&mut self, item: Value, index: usize, item_var: &str, index_var: &str) {
        self.variables.insert(item_var.to_string(), item);
        self.variables.insert(index_var.to_string(), Value::Number(index.into()));
    }
}

/// Inputs to one context build.
pub struct ContextArgs<'a> {
    pub workflow_state: &'a WorkflowState,
    pub workflow_config: &'a WorkflowConfig,
    pub task_config: &'a TaskConfig,
    /// All states of the workflow execution, in any order.
    pub states: &'a [TaskState],
    /// Explicit current input; falls back to the config's `with`.
    pub current_input: Option<&'a Map<String, Value>>,
    /// The live state of the current task, when one exists yet.
    pub current_state: Option<&'a TaskState>,
}

/// Builds normalization contexts. Owns the parent-context cache; one
/// instance is shared by every orchestrator of a process.
pub struct ContextBuilder {
    parent_cache: ParentContextCache,
    limits_override: Option<ConfigLimits>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self { parent_cache: ParentContextCache::default(), limits_override: None }
    }

    /// Pin limits instead of reading the process-wide configuration.
    pub fn with_limits(mut self, limits: ConfigLimits) -> Self {
        self.limits_override = Some(limits);
        self
    }

    fn limits(&self) -> ConfigLimits {
        self.limits_override.unwrap_or_else(limits::get)
    }

    /// Workflow-boundary cache maintenance (tag eviction or wholesale clear).
    pub fn end_workflow(&self, workflow_id: &str, workflow_exec_id: &str) {
        self.parent_cache.end_workflow(workflow_id, workflow_exec_id);
    }

    /// Build the context for one task against the live execution tree.
    pub fn build(&self, args: &ContextArgs<'_>) -> OrchResult<NormalizationContext> {
        if args.workflow_state.workflow_exec_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "workflow state has no workflow_exec_id".to_string(),
            ));
        }
        if args.task_config.id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput("task config has no id".to_string()));
        }
        let limits = self.limits();

        // Deterministic orderings: states by exec id, configs by task id.
        let mut sorted_states: Vec<&TaskState> = args.states.iter().collect();
        sorted_states.sort_by(|a, b| a.exec_id.cmp(&b.exec_id));

        let mut children_index: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for state in &sorted_states {
            if let Some(parent_exec_id) = &state.parent_exec_id {
                children_index
                    .entry(parent_exec_id.clone())
                    .or_default()
                    .push(state.exec_id.clone());
            }
        }
        for children in children_index.values_mut() {
            children.sort();
        }

        let states_by_exec: BTreeMap<&str, &TaskState> =
            sorted_states.iter().map(|s| (s.exec_id.as_str(), *s)).collect();
        let mut state_by_task: BTreeMap<String, &TaskState> = BTreeMap::new();
        for state in &sorted_states {
            state_by_task.insert(state.task_id.clone(), *state);
        }

        let mut task_configs: BTreeMap<String, TaskConfig> = BTreeMap::new();
        collect_configs(&args.workflow_config.tasks, &mut task_configs);
        collect_configs(std::slice::from_ref(args.task_config), &mut task_configs);

        let mut variables = VariableMap::new();
        variables.insert("workflow".to_string(), workflow_descriptor(args.workflow_state));

        let mut tasks = Map::new();
        for state in &sorted_states {
            let mut visited = BTreeSet::new();
            visited.insert(state.exec_id.clone());
            let ctx =
                task_context(state, 0, limits.max_children_depth, &children_index, &states_by_exec, &visited);
            tasks.insert(state.task_id.clone(), ctx);
        }
        variables.insert("tasks".to_string(), Value::Object(tasks));

        variables.insert("task".to_string(), task_descriptor(args.task_config));

        let current_input: Option<Map<String, Value>> = args
            .current_input
            .cloned()
            .or_else(|| args.task_config.with.clone());
        let mut current = Map::new();
        if let Some(input) = &current_input {
            current.insert("input".to_string(), Value::Object(input.clone()));
        }
        variables.insert("current".to_string(), Value::Object(current));

        if let Some(state) = args.current_state {
            variables.insert("state".to_string(), state_descriptor(state));
        }

        let parent_config = self.resolve_parent_config(args, &states_by_exec, &task_configs);
        if let Some(parent_config) = parent_config {
            let state_lookup = |task_id: &str| state_by_task.get(task_id).copied();
            let config_lookup = |task_id: &str| task_configs.get(task_id);
            let structural = |task_id: &str| args.workflow_config.find_parent_of(task_id);
            let linked = |task_id: &str| -> Option<String> {
                let state = state_by_task.get(task_id)?;
                let parent_exec = state.parent_exec_id.as_deref()?;
                states_by_exec.get(parent_exec).map(|s| s.task_id.clone())
            };
            let lookup = ParentLookup {
                workflow_id: &args.workflow_state.workflow_id,
                workflow_exec_id: &args.workflow_state.workflow_exec_id,
                max_parent_depth: limits.max_parent_depth,
                state_by_task: &state_lookup,
                config_by_id: &config_lookup,
                structural_parent: &structural,
                linked_parent: &linked,
            };
            let mut visited = BTreeSet::new();
            visited.insert(args.task_config.id.clone());
            if let Some(parent_value) =
                build_parent_context(&self.parent_cache, &lookup, Some(parent_config), 0, &visited)
            {
                variables.insert("parent".to_string(), parent_value);
            }
        }

        Ok(NormalizationContext {
            workflow_state: args.workflow_state.clone(),
            workflow_config: args.workflow_config.clone(),
            task_config: args.task_config.clone(),
            task_configs,
            current_input,
            children_index,
            variables,
        })
    }

    /// Derive a child's context from its parent's: copy the variable map and
    /// overlay `task` (the child's descriptor) and `parent` (the enclosing
    /// task's frame).
    pub fn sub_context(
        &self,
        base: &NormalizationContext,
        child_config: &TaskConfig,
        parent_config: &TaskConfig,
        parent_state: Option<&TaskState>,
    ) -> NormalizationContext {
        let mut ctx = base.clone();
        ctx.task_config = child_config.clone();

        let mut descriptor = task_descriptor(child_config);
        if let Value::Object(map) = &mut descriptor {
            if let Some(env) = merged_env(parent_config, child_config) {
                if let Ok(env) = serde_json::to_value(env) {
                    map.insert("env".to_string(), env);
                }
            }
        }
        ctx.variables.insert("task".to_string(), descriptor);
        ctx.variables
            .insert("parent".to_string(), parent_frame(parent_config, parent_state));
        ctx
    }

    /// Current task's parent config: runtime linkage first, then the
    /// structural walk of the workflow config tree.
    fn resolve_parent_config<'a>(
        &self,
        args: &'a ContextArgs<'_>,
        states_by_exec: &BTreeMap<&str, &TaskState>,
        task_configs: &'a BTreeMap<String, TaskConfig>,
    ) -> Option<&'a TaskConfig> {
        if let Some(parent_exec_id) =
            args.current_state.and_then(|s| s.parent_exec_id.as_deref())
        {
            if let Some(parent_state) = states_by_exec.get(parent_exec_id) {
                if let Some(config) = task_configs.get(&parent_state.task_id) {
                    return Some(config);
                }
                if let Some(config) = args.workflow_config.find_task(&parent_state.task_id) {
                    return Some(config);
                }
            }
        }
        args.workflow_config.find_parent_of(&args.task_config.id)
    }
}

/// Flatten a config tree into the by-id map, recursing into `tasks` and the
/// collection `task` template.
fn collect_configs(configs: &[TaskConfig], out: &mut BTreeMap<String, TaskConfig>) {
    for config in configs {
        out.entry(config.id.clone()).or_insert_with(|| config.clone());
        collect_configs(&config.tasks, out);
        if let Some(template) = config.task.as_deref() {
            collect_configs(std::slice::from_ref(template), out);
        }
    }
}

fn workflow_descriptor(state: &WorkflowState) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(state.workflow_id.clone()));
    map.insert("exec_id".to_string(), Value::String(state.workflow_exec_id.clone()));
    if let Ok(status) = serde_json::to_value(state.status) {
        map.insert("status".to_string(), status);
    }
    if let Some(input) = &state.input {
        map.insert("input".to_string(), Value::Object(input.clone()));
    }
    Value::Object(map)
}

/// The `task` variable: config-level fields of the task being normalized.
fn task_descriptor(config: &TaskConfig) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(config.id.clone()));
    map.insert("type".to_string(), Value::String(config.task_type.as_str().to_string()));
    if !config.action.is_empty() {
        map.insert("action".to_string(), Value::String(config.action.clone()));
    }
    if let Some(with) = &config.with {
        map.insert("with".to_string(), Value::Object(with.clone()));
    }
    if let Some(env) = &config.env {
        if let Ok(env) = serde_json::to_value(env) {
            map.insert("env".to_string(), env);
        }
    }
    Value::Object(map)
}

fn state_descriptor(state: &TaskState) -> Value {
    let mut map = Map::new();
    map.insert("exec_id".to_string(), Value::String(state.exec_id.clone()));
    map.insert("task_id".to_string(), Value::String(state.task_id.clone()));
    map.insert("status".to_string(), Value::String(state.status.as_str().to_string()));
    if let Some(parent_exec_id) = &state.parent_exec_id {
        map.insert("parent_exec_id".to_string(), Value::String(parent_exec_id.clone()));
    }
    Value::Object(map)
}

/// The output entry of a per-task context. Kept as a hook: engines that cap
/// or reshape outputs do it here.
fn task_output(state: &TaskState) -> Option<Value> {
    state.output.clone()
}

/// Per-task context: `{id, input, status}` always, `output`/`error` when
/// present, `children` recursively for child-bearing executions.
fn task_context(
    state: &TaskState,
    depth: usize,
    max_children_depth: usize,
    children_index: &BTreeMap<String, Vec<String>>,
    states_by_exec: &BTreeMap<&str, &TaskState>,
    visited: &BTreeSet<String>,
) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(state.task_id.clone()));
    if let Some(input) = &state.input {
        map.insert("input".to_string(), Value::Object(input.clone()));
    }
    map.insert("status".to_string(), Value::String(state.status.as_str().to_string()));
    if let Some(output) = task_output(state) {
        map.insert("output".to_string(), output);
    }
    if let Some(error) = &state.error {
        if let Ok(error) = serde_json::to_value(error) {
            map.insert("error".to_string(), error);
        }
    }

    if state.execution_type.is_child_bearing() && depth < max_children_depth {
        if let Some(child_execs) = children_index.get(&state.exec_id) {
            let mut children = Map::new();
            for child_exec in child_execs {
                let Some(child) = states_by_exec.get(child_exec.as_str()) else {
                    continue;
                };
                if visited.contains(child_exec) {
                    let mut marker = Map::new();
                    marker.insert("id".to_string(), Value::String(child.task_id.clone()));
                    marker.insert(
                        "error".to_string(),
                        Value::String(CHILDREN_CYCLE_ERROR.to_string()),
                    );
                    children.insert(child.task_id.clone(), Value::Object(marker));
                    continue;
                }
                // Per-branch copy so sibling subtrees don't see each other
                let mut visited = visited.clone();
                visited.insert(child_exec.clone());
                children.insert(
                    child.task_id.clone(),
                    task_context(
                        child,
                        depth + 1,
                        max_children_depth,
                        children_index,
                        states_by_exec,
                        &visited,
                    ),
                );
            }
            if !children.is_empty() {
                map.insert("children".to_string(), Value::Object(children));
            }
        }
    }
    Value::Object(map)
}

/// Parent env overlaid by child env (child wins).
fn merged_env(
    parent: &TaskConfig,
    child: &TaskConfig,
) -> Option<std::collections::BTreeMap<String, String>> {
    match (&parent.env, &child.env) {
        (None, None) => None,
        (Some(env), None) | (None, Some(env)) => Some(env.clone()),
        (Some(parent_env), Some(child_env)) => {
            let mut merged = parent_env.clone();
            merged.extend(child_env.clone());
            Some(merged)
        }
    }
}
