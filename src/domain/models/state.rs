//! Persistent task execution state.
//!
//! A [`TaskState`] is the mutable record of one execution of a task config.
//! States are created by orchestrators, mutated only inside transaction
//! scopes, and linked to their enclosing child-bearing task through
//! `parent_exec_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::task::TaskType;

/// Status of a task execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not started.
    #[default]
    Pending,
    /// Execution in flight.
    Running,
    /// Parked on a signal (wait tasks only).
    Waiting,
    /// Terminal: finished successfully.
    Success,
    /// Terminal: finished with an error.
    Failed,
    /// Terminal: canceled before completion.
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Valid transitions from this status.
    ///
    /// `waiting` is running-adjacent: wait tasks enter it at creation and
    /// leave only on a valid signal (success) or timeout (failed), plus
    /// workflow-level cancellation.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Waiting, Self::Canceled],
            Self::Running => &[Self::Success, Self::Failed, Self::Canceled, Self::Waiting],
            Self::Waiting => &[Self::Success, Self::Failed, Self::Canceled],
            Self::Success | Self::Failed | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Structured error recorded on a failed task state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    /// Human-readable failure description. Required.
    pub message: String,
    /// Machine-readable error code, when the executor provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Arbitrary structured detail attached by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None, details: None }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Persistent, mutable record of one execution of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Globally unique execution id (not the config id).
    pub exec_id: String,
    /// Config id this execution instantiates.
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_exec_id: String,
    /// Execution id of the enclosing child-bearing task; `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_exec_id: Option<String>,
    /// Type tag of the config, persisted so readers can tell child-bearing
    /// executions apart without the config in hand.
    pub execution_type: TaskType,
    pub status: TaskStatus,
    /// Resolved input map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Output; `None` until success (or a signal writes it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a fresh pending state for one execution of `task_id`.
    pub fn new(
        task_id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_exec_id: impl Into<String>,
        execution_type: TaskType,
    ) -> Self {
        let now = Utc::now();
        Self {
            exec_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            parent_exec_id: None,
            execution_type,
            status: TaskStatus::Pending,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Link this execution under a parent.
    pub fn with_parent(mut self, parent_exec_id: impl Into<String>) -> Self {
        self.parent_exec_id = Some(parent_exec_id.into());
        self
    }

    /// Set the resolved input.
    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Force a status, bypassing the state machine.
    ///
    /// Reserved for crash recovery, reconciliation, and test setup. Emits a
    /// warning every time so bypass sites stay visible in logs.
    pub fn force_status(&mut self, new_status: TaskStatus, reason: &str) {
        tracing::warn!(
            exec_id = %self.exec_id,
            from = %self.status.as_str(),
            to = %new_status.as_str(),
            reason = reason,
            "Forcing task status transition (bypassing state machine)"
        );
        self.status = new_status;
        self.updated_at = Utc::now();
    }

    /// Record a failure: status plus structured error.
    pub fn mark_failed(&mut self, error: TaskErrorInfo) {
        if self.status != TaskStatus::Failed {
            if self.can_transition_to(TaskStatus::Failed) {
                self.status = TaskStatus::Failed;
            } else {
                self.force_status(TaskStatus::Failed, "failure recorded on terminal state");
            }
        }
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Validate the invariants every persisted state must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.exec_id.trim().is_empty() {
            return Err("exec_id cannot be empty".to_string());
        }
        if self.task_id.trim().is_empty() {
            return Err("task_id cannot be empty".to_string());
        }
        if self.workflow_exec_id.trim().is_empty() {
            return Err("workflow_exec_id cannot be empty".to_string());
        }
        Ok(())
    }
}
