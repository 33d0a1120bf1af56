//! Workflow definition and execution state carried through normalization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::{TaskConfig, TaskType};

/// Status of a workflow execution, as reported by the external runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Success,
    Failed,
    Canceled,
}

/// Runtime state of one workflow execution.
///
/// The core never mutates this; it is an input to normalization (visible to
/// templates as `workflow`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_exec_id: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Workflow-level input, visible to templates as `workflow.input`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, workflow_exec_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            status: WorkflowStatus::Running,
            input: None,
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = Some(input);
        self
    }
}

/// Declarative workflow definition: an ordered list of task configs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl WorkflowConfig {
    /// Parse a workflow definition from its declarative YAML form.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Find a top-level task config by id.
    pub fn task_by_id(&self, task_id: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Find a task config anywhere in the tree, recursing into parallel and
    /// composite `tasks` and the collection `task` template.
    pub fn find_task(&self, task_id: &str) -> Option<&TaskConfig> {
        fn walk<'a>(configs: &'a [TaskConfig], task_id: &str) -> Option<&'a TaskConfig> {
            for config in configs {
                if config.id == task_id {
                    return Some(config);
                }
                if let Some(found) = walk(&config.tasks, task_id) {
                    return Some(found);
                }
                if let Some(template) = config.task.as_deref() {
                    if template.id == task_id {
                        return Some(template);
                    }
                    if let Some(found) = walk(std::slice::from_ref(template), task_id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&self.tasks, task_id)
    }

    /// Structural parent lookup: the config whose `tasks` (or collection
    /// `task` template) contains `task_id`.
    pub fn find_parent_of(&self, task_id: &str) -> Option<&TaskConfig> {
        fn walk<'a>(candidate: &'a TaskConfig, task_id: &str) -> Option<&'a TaskConfig> {
            for child in &candidate.tasks {
                if child.id == task_id {
                    return Some(candidate);
                }
                if let Some(found) = walk(child, task_id) {
                    return Some(found);
                }
            }
            if let Some(template) = candidate.task.as_deref() {
                if template.id == task_id {
                    return Some(candidate);
                }
                if let Some(found) = walk(template, task_id) {
                    return Some(found);
                }
            }
            None
        }
        self.tasks.iter().find_map(|t| walk(t, task_id))
    }

    /// The task declared after `task_id` in top-level order, used as the
    /// default `next` when no transition overrides it.
    pub fn declared_next(&self, task_id: &str) -> Option<&str> {
        let idx = self.tasks.iter().position(|t| t.id == task_id)?;
        self.tasks.get(idx + 1).map(|t| t.id.as_str())
    }

    /// Validate every task config in the tree.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("workflow id cannot be empty".to_string());
        }
        fn walk(configs: &[TaskConfig]) -> Result<(), String> {
            for config in configs {
                config.validate()?;
                walk(&config.tasks)?;
                if let Some(template) = config.task.as_deref() {
                    template.validate()?;
                    if template.task_type == TaskType::Collection {
                        return Err(format!(
                            "collection task {} nests another collection template",
                            config.id
                        ));
                    }
                }
            }
            Ok(())
        }
        walk(&self.tasks)
    }
}
