//! Domain errors for the orchestration core.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Variants map to error kinds rather than concrete failure sites: callers
/// branch on the kind (retryable vs. terminal, surfaced vs. swallowed), not
/// on where the failure originated.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A required entity was missing or empty (nil workflow state, nil task
    /// config, empty exec id). Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A persisted state failed validation before a write.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A referenced entity could not be located.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Raw template engine failure; the normalizer wraps it into
    /// [`OrchestrationError::TemplateEvaluation`].
    #[error("Template error: {0}")]
    Template(String),

    /// The template engine rejected a config during normalization.
    #[error("failed to normalize {task_type} task config: {message}")]
    TemplateEvaluation { task_type: String, message: String },

    /// The orchestrator factory has no constructor for the type tag.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// A router task matched no route and declared no default.
    #[error("no route matched for task {task_id}")]
    NoRoute { task_id: String },

    /// A task failed and no `on_error.next` transition exists.
    #[error("task {task_id} failed with no error transition: {source}")]
    NoErrorTransition {
        task_id: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    /// The transactional parent status update failed.
    #[error("parent status update failed for parent {parent_exec_id} (child {child_exec_id}): {source}")]
    ParentUpdateFailed {
        parent_exec_id: String,
        child_exec_id: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    /// Post-success output transformation failed; the task is failed with
    /// this error.
    #[error("output transformation failed for task {task_id}: {message}")]
    OutputTransformation { task_id: String, message: String },

    /// A caller-supplied transformation aborted its transaction.
    #[error("task processing failed: {source}")]
    TaskProcessing {
        #[source]
        source: Box<OrchestrationError>,
    },

    /// An invalid status transition was attempted on a task state.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A signal did not satisfy the wait config.
    #[error("signal rejected: {0}")]
    SignalRejected(String),

    /// Underlying store failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Task execution reported a failure, either thrown by the runtime or
    /// detected in the task output.
    #[error("{0}")]
    ExecutionFailed(String),
}

pub type OrchResult<T> = Result<T, OrchestrationError>;

impl OrchestrationError {
    /// Build a `NotFound` for a task state by execution id.
    pub fn state_not_found(exec_id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Task state", id: exec_id.into() }
    }

    /// Build a `NotFound` for a task config by task id.
    pub fn config_not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Task config", id: task_id.into() }
    }
}

impl From<sqlx::Error> for OrchestrationError {
    fn from(err: sqlx::Error) -> Self {
        OrchestrationError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        OrchestrationError::Serialization(err.to_string())
    }
}
