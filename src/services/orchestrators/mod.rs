//! Task orchestrators.
//!
//! One orchestrator owns the complete lifecycle of one task type: state
//! creation, child preparation and creation, signal handling, and response
//! aggregation. Orchestrators are created per call by the factory and carry
//! their dependencies on an injected [`OrchestratorContext`].

pub mod aggregate;
pub mod basic;
pub mod collection;
pub mod composite;
pub mod parallel;
pub mod router;
pub mod signal;
pub mod wait;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::models::{
    Signal, TaskConfig, TaskErrorInfo, TaskState, TaskStatus, TaskType, TransitionConfig,
    WorkflowConfig, WorkflowState,
};
use crate::domain::ports::{MetadataStore, SignalDispatcher, StateRepository, TemplateEngine};
use crate::services::context::{ContextArgs, ContextBuilder, NormalizationContext};
use crate::services::factory::OrchestratorFactory;
use crate::services::normalizer::ConfigNormalizer;
use crate::services::transaction::TransactionService;

pub use aggregate::{AggregateOrchestrator, ReducerRegistry};
pub use basic::BasicOrchestrator;
pub use collection::CollectionOrchestrator;
pub use composite::CompositeOrchestrator;
pub use parallel::ParallelOrchestrator;
pub use router::RouterOrchestrator;
pub use signal::SignalOrchestrator;
pub use wait::WaitOrchestrator;

/// Cooperative cancellation flag carried on response inputs.
///
/// The external runtime sets it when the activity context is canceled; the
/// response handler then short-circuits, returning the state unchanged so
/// the runtime can do its own cancellation bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Request record for state creation, supplied by the external runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStateInput {
    pub workflow_state: WorkflowState,
    pub workflow_config: WorkflowConfig,
    pub task_config: TaskConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_exec_id: Option<String>,
}

/// Request record for response handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleResponseInput {
    pub workflow_state: WorkflowState,
    pub workflow_config: WorkflowConfig,
    pub task_config: TaskConfig,
    pub state: TaskState,
    /// Error thrown by the executor, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<TaskErrorInfo>,
    /// Raw output produced by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Incoming signal, for wait tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(skip)]
    pub cancellation: CancellationFlag,
}

impl HandleResponseInput {
    pub fn new(
        workflow_state: WorkflowState,
        workflow_config: WorkflowConfig,
        task_config: TaskConfig,
        state: TaskState,
    ) -> Self {
        Self {
            workflow_state,
            workflow_config,
            task_config,
            state,
            execution_error: None,
            output: None,
            signal: None,
            cancellation: CancellationFlag::new(),
        }
    }
}

/// A parent whose status changed as a consequence of this response; the
/// runtime re-enqueues it for response handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentUpdate {
    pub parent_exec_id: String,
    pub status: TaskStatus,
}

/// Response record handed back to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<TransitionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionConfig>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_update: Option<ParentUpdate>,
}

/// Full product of one response-handling call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponseEnvelope {
    pub response: TaskResponse,
    pub state: TaskState,
}

/// A child created by the core; the runtime schedules it with the config
/// echoed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedChild {
    pub task_config: TaskConfig,
    pub state: TaskState,
}

/// Prepared-children record persisted in the metadata store, one per parent
/// execution id. Field meaning varies per orchestrator; unused fields stay
/// unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildrenMetadata {
    /// Ordered child configs, ids already disambiguated.
    pub child_configs: Vec<TaskConfig>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_on_fail: Option<bool>,
    /// Children created so far (batch cursor).
    #[serde(default)]
    pub created: usize,
    /// Output of the previous composite step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_output: Option<Value>,
}

/// Metadata-store key for a parent's prepared children.
pub fn children_key(parent_exec_id: &str) -> String {
    format!("children:{parent_exec_id}")
}

/// Nesting depth of a config tree, counting the config itself.
fn config_depth(config: &TaskConfig) -> usize {
    let nested = config.tasks.iter().map(config_depth).max().unwrap_or(0);
    let template = config.task.as_deref().map(config_depth).unwrap_or(0);
    1 + nested.max(template)
}

/// Dependencies injected into every orchestrator.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub states: Arc<dyn StateRepository>,
    pub metadata: Arc<dyn MetadataStore>,
    pub engine: Arc<dyn TemplateEngine>,
    pub dispatcher: Option<Arc<dyn SignalDispatcher>>,
    pub context_builder: Arc<ContextBuilder>,
    pub normalizer: Arc<ConfigNormalizer>,
    pub transactions: Arc<TransactionService>,
    pub factory: Arc<OrchestratorFactory>,
    pub reducers: Arc<ReducerRegistry>,
}

impl OrchestratorContext {
    /// Wire the context with the built-in orchestrator set registered.
    pub fn new(
        states: Arc<dyn StateRepository>,
        metadata: Arc<dyn MetadataStore>,
        engine: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            states: states.clone(),
            metadata,
            engine: engine.clone(),
            dispatcher: None,
            context_builder: Arc::new(ContextBuilder::new()),
            normalizer: Arc::new(ConfigNormalizer::new(engine)),
            transactions: Arc::new(TransactionService::new(states)),
            factory: Arc::new(OrchestratorFactory::with_builtins()),
            reducers: Arc::new(ReducerRegistry::default()),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn SignalDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}

/// The orchestrator contract. Every task type implements all four
/// operations; the optional capabilities below are opted into per type.
#[async_trait]
pub trait TaskOrchestrator: Send + Sync {
    /// The task type this orchestrator owns.
    fn get_type(&self) -> TaskType;

    /// Normalize the config against the live execution tree, ahead of state
    /// creation.
    async fn prepare_execution(&self, input: &CreateStateInput) -> OrchResult<TaskConfig>;

    /// Create and persist the initial state for one execution.
    async fn create_state(&self, input: &CreateStateInput) -> OrchResult<TaskState>;

    /// Handle the executor's response for a completed invocation.
    async fn handle_response(&self, input: &HandleResponseInput)
        -> OrchResult<TaskResponseEnvelope>;

    fn as_child_manager(&self) -> Option<&dyn ChildTaskManager> {
        None
    }

    fn as_signal_handler(&self) -> Option<&dyn SignalHandler> {
        None
    }

    fn as_status_aggregator(&self) -> Option<&dyn ChildStatusAggregator> {
        None
    }
}

/// Capability of child-bearing orchestrators.
#[async_trait]
pub trait ChildTaskManager: Send + Sync {
    /// Materialize the ordered child configs and persist them, with
    /// orchestrator metadata, under the parent's exec id.
    async fn prepare_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<ChildrenMetadata>;

    /// Create child states for the next cycle (one batch, one step, or all
    /// at once, per type). Safe to re-invoke; exhausted parents create
    /// nothing.
    async fn create_children(
        &self,
        input: &CreateStateInput,
        parent: &TaskState,
    ) -> OrchResult<Vec<CreatedChild>>;

    /// The prepared-children record, when one exists.
    async fn children_metadata(&self, parent_exec_id: &str) -> OrchResult<Option<ChildrenMetadata>>;

    /// Hook invoked when a child of this parent reaches a terminal status,
    /// before the parent status is recomputed.
    async fn on_child_terminal(
        &self,
        input: &HandleResponseInput,
        parent: &TaskState,
        child: &TaskState,
    ) -> OrchResult<()> {
        let _ = (input, parent, child);
        Ok(())
    }
}

/// Capability of signal-consuming orchestrators.
pub trait SignalHandler: Send + Sync {
    /// Reject signals the config does not accept (wrong name, mismatched
    /// correlation id).
    fn validate_signal(&self, config: &TaskConfig, signal: &Signal) -> OrchResult<()>;

    /// Produce the output recorded on the state for an accepted signal.
    fn process_signal(&self, state: &TaskState, signal: &Signal) -> OrchResult<Value>;
}

/// Capability of status-aggregating orchestrators.
#[async_trait]
pub trait ChildStatusAggregator: Send + Sync {
    /// Derive the parent's status from its children. Pure with respect to
    /// the store: reads only.
    async fn calculate_status(&self, parent: &TaskState) -> OrchResult<TaskStatus>;

    fn should_update_status(&self, current: TaskStatus, computed: TaskStatus) -> bool {
        crate::services::aggregator::should_update(current, computed)
    }
}

/// Response flow shared by the child-bearing orchestrators.
///
/// A parent's own response handling is gated on its aggregator: while
/// children are still in flight the state goes back untouched (the runtime
/// retries after the next completion); a failed aggregate walks the error
/// path; success runs the normal flow (output transformation for composite,
/// already-finalized output for the deferred types).
pub(crate) async fn handle_parent_response(
    base: &BaseOrchestrator,
    aggregator: &dyn ChildStatusAggregator,
    input: &HandleResponseInput,
) -> OrchResult<TaskResponseEnvelope> {
    use crate::services::response::{passthrough, ResponseHandler, ResponseOptions};

    if input.cancellation.is_cancelled() {
        return Ok(passthrough(input.state.clone()));
    }

    let computed = aggregator.calculate_status(&input.state).await?;
    match computed {
        TaskStatus::Success => {
            ResponseHandler::new(base.ctx.clone())
                .handle(input, ResponseOptions::default())
                .await
        }
        TaskStatus::Failed => {
            let mut scoped = input.clone();
            if scoped.execution_error.is_none() {
                scoped.execution_error = Some(input.state.error.clone().unwrap_or_else(|| {
                    TaskErrorInfo::new("one or more child tasks failed")
                }));
            }
            ResponseHandler::new(base.ctx.clone())
                .handle(&scoped, ResponseOptions::default())
                .await
        }
        // Canceled parents keep their aggregation-assigned state; anything
        // non-terminal means children are still running.
        _ => Ok(passthrough(input.state.clone())),
    }
}

/// Common state construction shared by every orchestrator.
#[derive(Clone)]
pub struct BaseOrchestrator {
    pub ctx: OrchestratorContext,
    task_type: TaskType,
}

impl BaseOrchestrator {
    pub fn new(ctx: OrchestratorContext, task_type: TaskType) -> Self {
        Self { ctx, task_type }
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn validate_input(input: &CreateStateInput) -> OrchResult<()> {
        if input.workflow_state.workflow_exec_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "create state input has no workflow exec id".to_string(),
            ));
        }
        if input.task_config.id.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "create state input has no task config id".to_string(),
            ));
        }
        let max_nesting = crate::services::limits::get().max_nesting_depth;
        if config_depth(&input.task_config) > max_nesting {
            return Err(OrchestrationError::InvalidInput(format!(
                "task config {} exceeds maximum nesting depth ({max_nesting})",
                input.task_config.id
            )));
        }
        Ok(())
    }

    /// Build a normalization context against the current execution tree.
    pub async fn normalization_context(
        &self,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
        current_state: Option<&TaskState>,
    ) -> OrchResult<NormalizationContext> {
        let states = self.ctx.states.list_states(&workflow_state.workflow_exec_id).await?;
        self.ctx.context_builder.build(&ContextArgs {
            workflow_state,
            workflow_config,
            task_config,
            states: &states,
            current_input: None,
            current_state,
        })
    }

    /// Normalize the input's config for this orchestrator's type.
    pub async fn prepare(&self, input: &CreateStateInput) -> OrchResult<TaskConfig> {
        Self::validate_input(input)?;
        let ctx = self
            .normalization_context(
                &input.workflow_state,
                &input.workflow_config,
                &input.task_config,
                None,
            )
            .await?;
        self.ctx.normalizer.normalize_as(self.task_type, &input.task_config, &ctx)
    }

    /// Default state creation: normalize, populate ids and linkage, persist
    /// as pending. `tweak` adjusts the state before the write (wait tasks
    /// park themselves here).
    pub async fn create_state_with(
        &self,
        input: &CreateStateInput,
        tweak: impl FnOnce(&mut TaskState) + Send,
    ) -> OrchResult<TaskState> {
        let config = self.prepare(input).await?;

        let mut state = TaskState::new(
            config.id.clone(),
            input.workflow_state.workflow_id.clone(),
            input.workflow_state.workflow_exec_id.clone(),
            input.task_config.task_type,
        );
        if let Some(parent_exec_id) = &input.parent_exec_id {
            state = state.with_parent(parent_exec_id.clone());
        }
        if let Some(with) = config.with.clone() {
            state.input = Some(with);
        }
        tweak(&mut state);

        self.ctx.states.save_state(&state).await?;
        tracing::debug!(
            exec_id = %state.exec_id,
            task_id = %state.task_id,
            task_type = %state.execution_type.as_str(),
            status = %state.status.as_str(),
            "Created task state"
        );
        Ok(state)
    }

    /// Spawn one child execution through the factory, preparing its own
    /// children when the child is itself child-bearing.
    pub async fn spawn_child(
        &self,
        input: &CreateStateInput,
        child_config: &TaskConfig,
        parent: &TaskState,
    ) -> OrchResult<CreatedChild> {
        let child_input = CreateStateInput {
            workflow_state: input.workflow_state.clone(),
            workflow_config: input.workflow_config.clone(),
            task_config: child_config.clone(),
            parent_exec_id: Some(parent.exec_id.clone()),
        };
        let orchestrator = self.ctx.factory.create(child_config.task_type, &self.ctx)?;
        let state = orchestrator.create_state(&child_input).await?;
        if let Some(manager) = orchestrator.as_child_manager() {
            manager.prepare_children(&child_input, &state).await?;
        }
        Ok(CreatedChild { task_config: child_config.clone(), state })
    }

    /// Cancel every non-terminal sibling of `except_exec_id` under `parent`.
    pub async fn cancel_siblings(
        &self,
        parent_exec_id: &str,
        except_exec_id: &str,
    ) -> OrchResult<()> {
        let children = self.ctx.states.list_children(parent_exec_id).await?;
        for child in children {
            if child.exec_id == except_exec_id || child.is_terminal() {
                continue;
            }
            self.ctx
                .transactions
                .apply_transformation(&child.exec_id, |state| {
                    if !state.is_terminal() {
                        state
                            .transition_to(TaskStatus::Canceled)
                            .map_err(OrchestrationError::InvalidState)?;
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }
}
