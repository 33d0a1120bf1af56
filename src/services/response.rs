//! Post-execution response handling.
//!
//! One flow shared by every orchestrator: detect errors reported through
//! the output, run output transformation (deferred for child-bearing types
//! whose output depends on aggregated child results), persist the terminal
//! state, recompute the parent status, and normalize the configured
//! transitions against an up-to-date context.

use serde_json::{json, Map, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{TaskConfig, TaskErrorInfo, TaskState, TaskStatus, TransitionConfig};
use crate::services::context::{ContextArgs, NormalizationContext};
use crate::services::orchestrators::{
    children_key, ChildrenMetadata, HandleResponseInput, OrchestratorContext, ParentUpdate,
    TaskResponse, TaskResponseEnvelope,
};

/// Per-call options type-specific orchestrators pass into the shared flow.
#[derive(Debug, Default)]
pub struct ResponseOptions {
    /// Explicit next-task override (router route selection).
    pub next_override: Option<String>,
}

pub struct ResponseHandler {
    ctx: OrchestratorContext,
}

impl ResponseHandler {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Run the response flow for a completed task invocation.
    pub async fn handle(
        &self,
        input: &HandleResponseInput,
        opts: ResponseOptions,
    ) -> OrchResult<TaskResponseEnvelope> {
        // Cancellation short-circuits: the state goes back unchanged and no
        // error propagates, so the runtime can do its own bookkeeping.
        if input.cancellation.is_cancelled() {
            return Ok(envelope(input.state.clone(), None, None, None, None));
        }

        let mut state = input.state.clone();
        if let Some(output) = &input.output {
            state.output = Some(output.clone());
        }

        // Errors surfaced through the output are equivalent to thrown
        // execution errors.
        let mut failure = input
            .execution_error
            .clone()
            .or_else(|| detect_output_error(state.output.as_ref()));

        if failure.is_none() && !state.execution_type.defers_output_transformation() {
            if let Some(outputs) = &input.task_config.outputs {
                match self.transform_output(input, &state, outputs).await {
                    Ok(transformed) => state.output = Some(transformed),
                    Err(err) => {
                        let err = OrchestrationError::OutputTransformation {
                            task_id: state.task_id.clone(),
                            message: err.to_string(),
                        };
                        failure = Some(TaskErrorInfo::new(err.to_string()));
                    }
                }
            }
        }

        match &failure {
            None => finalize_status(&mut state, TaskStatus::Success),
            Some(error) => state.mark_failed(error.clone()),
        }

        let persisted = self.ctx.transactions.save_state_with_locking(&state).await?;
        state = persisted;

        // Each child transition triggers at most one parent recomputation,
        // serialized through the parent's row lock.
        let mut parent_update = None;
        if state.is_terminal() {
            if let Some(parent_exec_id) = state.parent_exec_id.clone() {
                parent_update = self
                    .update_parent(input, &state, &parent_exec_id)
                    .await
                    .map_err(|err| {
                        tracing::error!(
                            parent_exec_id = %parent_exec_id,
                            child_exec_id = %state.exec_id,
                            error = %err,
                            "Parent status update failed"
                        );
                        OrchestrationError::ParentUpdateFailed {
                            parent_exec_id: parent_exec_id.clone(),
                            child_exec_id: state.exec_id.clone(),
                            source: Box::new(err),
                        }
                    })?;
            }
        }

        // Transitions are normalized against the tree as it stands now.
        let ctx = self.response_context(input, &state).await?;
        let on_success = self.normalize_transition(&input.task_config.on_success, &ctx)?;
        let on_error = self.normalize_transition(&input.task_config.on_error, &ctx)?;

        if let Some(error) = &failure {
            if on_error.as_ref().and_then(|t| t.next.as_deref()).is_none() {
                return Err(OrchestrationError::NoErrorTransition {
                    task_id: state.task_id.clone(),
                    source: Box::new(OrchestrationError::ExecutionFailed(error.message.clone())),
                });
            }
        }

        let next_task = opts.next_override.or_else(|| {
            if failure.is_none() {
                on_success
                    .as_ref()
                    .and_then(|t| t.next.clone())
                    .or_else(|| {
                        input
                            .workflow_config
                            .declared_next(&state.task_id)
                            .map(str::to_string)
                    })
            } else {
                on_error.as_ref().and_then(|t| t.next.clone())
            }
        });

        Ok(envelope(state, on_success, on_error, next_task, parent_update))
    }

    /// Template pass over the configured `outputs` map. The raw output is
    /// visible to the templates as `output`.
    async fn transform_output(
        &self,
        input: &HandleResponseInput,
        state: &TaskState,
        outputs: &Map<String, Value>,
    ) -> OrchResult<Value> {
        let ctx = self.response_context(input, state).await?;
        let mut variables = ctx.variables;
        variables.insert("output".to_string(), state.output.clone().unwrap_or(Value::Null));
        self.ctx.engine.parse_any(&Value::Object(outputs.clone()), &variables)
    }

    async fn response_context(
        &self,
        input: &HandleResponseInput,
        state: &TaskState,
    ) -> OrchResult<NormalizationContext> {
        let states = self
            .ctx
            .states
            .list_states(&input.workflow_state.workflow_exec_id)
            .await?;
        self.ctx.context_builder.build(&ContextArgs {
            workflow_state: &input.workflow_state,
            workflow_config: &input.workflow_config,
            task_config: &input.task_config,
            states: &states,
            current_input: state.input.as_ref(),
            current_state: Some(state),
        })
    }

    fn normalize_transition(
        &self,
        transition: &Option<TransitionConfig>,
        ctx: &NormalizationContext,
    ) -> OrchResult<Option<TransitionConfig>> {
        transition
            .as_ref()
            .map(|t| self.ctx.normalizer.normalize_transition(t, ctx))
            .transpose()
    }

    /// Recompute and, when changed, persist the parent's status; finalize
    /// deferred output once the parent is terminal.
    async fn update_parent(
        &self,
        input: &HandleResponseInput,
        child: &TaskState,
        parent_exec_id: &str,
    ) -> OrchResult<Option<ParentUpdate>> {
        let parent = self.ctx.states.get_parent_state(parent_exec_id).await?;
        let orchestrator = self.ctx.factory.create(parent.execution_type, &self.ctx)?;

        if let Some(manager) = orchestrator.as_child_manager() {
            manager.on_child_terminal(input, &parent, child).await?;
        }

        let Some(aggregator) = orchestrator.as_status_aggregator() else {
            return Ok(None);
        };
        let computed = aggregator.calculate_status(&parent).await?;
        if !aggregator.should_update_status(parent.status, computed) {
            return Ok(None);
        }

        self.ctx
            .transactions
            .apply_transformation(parent_exec_id, move |p| {
                if p.status.is_terminal() {
                    return Ok(());
                }
                apply_aggregated_status(p, computed);
                Ok(())
            })
            .await?;

        if computed.is_terminal() {
            self.finalize_parent(input, &parent, computed).await?;
        }

        Ok(Some(ParentUpdate {
            parent_exec_id: parent_exec_id.to_string(),
            status: computed,
        }))
    }

    /// Deferred output transformation for parallel/collection parents, plus
    /// prepared-children cleanup for every child-bearing type.
    async fn finalize_parent(
        &self,
        input: &HandleResponseInput,
        parent: &TaskState,
        computed: TaskStatus,
    ) -> OrchResult<()> {
        let key = children_key(&parent.exec_id);

        if parent.execution_type.defers_output_transformation() {
            use crate::domain::ports::MetadataStoreExt;
            let meta: Option<ChildrenMetadata> = self.ctx.metadata.load_as(&key).await?;
            let children = self.ctx.states.list_children(&parent.exec_id).await?;
            if children.iter().any(|c| !c.is_terminal()) {
                // A sibling write slipped in between recompute and here;
                // the next completion finalizes.
                return Ok(());
            }

            let statuses: Vec<TaskStatus> = children.iter().map(|c| c.status).collect();
            let progress = crate::services::aggregator::ChildrenProgress::from_statuses(&statuses);
            tracing::debug!(
                parent_exec_id = %parent.exec_id,
                status = %computed.as_str(),
                total = progress.total,
                succeeded = progress.succeeded,
                failed = progress.failed,
                canceled = progress.canceled,
                "Finalizing parent output"
            );

            let aggregated = build_aggregated_output(meta.as_ref(), &children);
            let output = if computed == TaskStatus::Success {
                match input.workflow_config.find_task(&parent.task_id) {
                    Some(config) => {
                        self.transform_parent_output(input, parent, config, &aggregated).await?
                    }
                    None => aggregated,
                }
            } else {
                aggregated
            };

            self.ctx
                .transactions
                .apply_transformation(&parent.exec_id, move |p| {
                    p.output = Some(output);
                    Ok(())
                })
                .await?;

            // The local copy is not authoritative post-transaction: re-read
            // so interleaved writes to status/output/error are observed.
            let _ = self.ctx.states.get_state(&parent.exec_id).await?;
        }

        self.ctx.metadata.delete(&key).await?;
        Ok(())
    }

    async fn transform_parent_output(
        &self,
        input: &HandleResponseInput,
        parent: &TaskState,
        parent_config: &TaskConfig,
        aggregated: &Value,
    ) -> OrchResult<Value> {
        let Some(outputs) = &parent_config.outputs else {
            return Ok(aggregated.clone());
        };
        let states = self
            .ctx
            .states
            .list_states(&input.workflow_state.workflow_exec_id)
            .await?;
        let ctx = self.ctx.context_builder.build(&ContextArgs {
            workflow_state: &input.workflow_state,
            workflow_config: &input.workflow_config,
            task_config: parent_config,
            states: &states,
            current_input: parent.input.as_ref(),
            current_state: Some(parent),
        })?;
        let mut variables = ctx.variables;
        variables.insert("output".to_string(), aggregated.clone());
        self.ctx
            .engine
            .parse_any(&Value::Object(outputs.clone()), &variables)
            .map_err(|e| OrchestrationError::OutputTransformation {
                task_id: parent.task_id.clone(),
                message: e.to_string(),
            })
    }
}

/// Envelope returning the state untouched: cancellation short-circuits and
/// parents whose children are still running.
pub(crate) fn passthrough(state: TaskState) -> TaskResponseEnvelope {
    envelope(state, None, None, None, None)
}

fn envelope(
    state: TaskState,
    on_success: Option<TransitionConfig>,
    on_error: Option<TransitionConfig>,
    next_task: Option<String>,
    parent_update: Option<ParentUpdate>,
) -> TaskResponseEnvelope {
    TaskResponseEnvelope {
        response: TaskResponse {
            on_success,
            on_error,
            state: state.clone(),
            next_task,
            parent_update,
        },
        state,
    }
}

/// Drive a state to a terminal status through the state machine, forcing
/// only when an unexpected prior status makes the legal path impossible.
fn finalize_status(state: &mut TaskState, target: TaskStatus) {
    if state.status == TaskStatus::Pending {
        let _ = state.transition_to(TaskStatus::Running);
    }
    if state.status == target {
        return;
    }
    if state.can_transition_to(target) {
        let _ = state.transition_to(target);
    } else {
        state.force_status(target, "response finalization");
    }
}

/// Apply an aggregator-computed status onto the locked parent row.
fn apply_aggregated_status(parent: &mut TaskState, computed: TaskStatus) {
    if parent.status == TaskStatus::Pending && computed != TaskStatus::Running {
        let _ = parent.transition_to(TaskStatus::Running);
    }
    if parent.status == computed {
        return;
    }
    if parent.can_transition_to(computed) {
        let _ = parent.transition_to(computed);
    } else {
        parent.force_status(computed, "aggregated from children");
    }
    if computed == TaskStatus::Failed && parent.error.is_none() {
        parent.error = Some(TaskErrorInfo::new("one or more child tasks failed"));
    }
}

/// Error detection over a task output, applied on every response even
/// without a thrown execution error.
fn detect_output_error(output: Option<&Value>) -> Option<TaskErrorInfo> {
    let map = output?.as_object()?;

    if let Some(error) = map.get("error") {
        match error {
            Value::String(message) if !message.is_empty() => {
                return Some(TaskErrorInfo::new(format!("task output error: {message}")));
            }
            Value::Object(fields) => {
                if let Some(Value::String(message)) = fields.get("message") {
                    if !message.is_empty() {
                        let mut info = TaskErrorInfo::new(format!("task output error: {message}"));
                        info.details = Some(error.clone());
                        return Some(info);
                    }
                }
            }
            _ => {}
        }
    }

    let reported_false = match map.get("success") {
        Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
        _ => false,
    };
    if reported_false {
        return Some(TaskErrorInfo::new("task output reported success=false".to_string()));
    }
    None
}

/// Index-ordered aggregation of child results: successful outputs under
/// `results`, failures under `errors`. Prepared order wins over completion
/// order.
fn build_aggregated_output(meta: Option<&ChildrenMetadata>, children: &[TaskState]) -> Value {
    let ordered: Vec<&TaskState> = match meta {
        Some(meta) if !meta.child_configs.is_empty() => meta
            .child_configs
            .iter()
            .filter_map(|config| children.iter().find(|c| c.task_id == config.id))
            .collect(),
        _ => children.iter().collect(),
    };

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for child in ordered {
        match child.status {
            TaskStatus::Success => {
                results.push(child.output.clone().unwrap_or(Value::Null));
            }
            TaskStatus::Failed => {
                let message = child
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "task failed".to_string());
                errors.push(json!({"task_id": child.task_id, "error": message}));
            }
            _ => {}
        }
    }

    let mut out = Map::new();
    out.insert("results".to_string(), Value::Array(results));
    if !errors.is_empty() {
        out.insert("errors".to_string(), Value::Array(errors));
    }
    Value::Object(out)
}
