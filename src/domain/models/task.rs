//! Declarative task configuration.
//!
//! A [`TaskConfig`] is the immutable description of one task in a workflow
//! definition. Configs carry templated fields (`{{ ... }}` expressions) that
//! the normalizer resolves against the live execution tree before the task
//! runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The type tag of a task, driving orchestrator selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Single unit of work with no children.
    #[default]
    Basic,
    /// Runs declared children concurrently under a strategy.
    Parallel,
    /// Expands an item source into one child per retained item.
    Collection,
    /// Sequential pipeline of child steps.
    Composite,
    /// Selects the next task from the first matching route.
    Router,
    /// Collects outputs of other tasks into one output.
    Aggregate,
    /// Parks until a matching signal arrives.
    Wait,
    /// Dispatches a signal to configured targets.
    Signal,
    /// Memory read/write; executes as a basic task at this boundary.
    Memory,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Parallel => "parallel",
            Self::Collection => "collection",
            Self::Composite => "composite",
            Self::Router => "router",
            Self::Aggregate => "aggregate",
            Self::Wait => "wait",
            Self::Signal => "signal",
            Self::Memory => "memory",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "basic" | "" => Some(Self::Basic),
            "parallel" => Some(Self::Parallel),
            "collection" => Some(Self::Collection),
            "composite" => Some(Self::Composite),
            "router" => Some(Self::Router),
            "aggregate" => Some(Self::Aggregate),
            "wait" => Some(Self::Wait),
            "signal" => Some(Self::Signal),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Whether tasks of this type create other task executions.
    pub fn is_child_bearing(&self) -> bool {
        matches!(self, Self::Parallel | Self::Collection | Self::Composite)
    }

    /// Whether output transformation is deferred until all children are
    /// terminal (the output depends on aggregated child results).
    pub fn defers_output_transformation(&self) -> bool {
        matches!(self, Self::Parallel | Self::Collection)
    }
}

/// Policy deriving a parent's status from its children's statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    /// Success iff every child succeeds; fails only once all are terminal.
    #[default]
    WaitAll,
    /// First child failure fails the parent; siblings are canceled.
    FailFast,
    /// Success once every child is terminal, regardless of individual results.
    BestEffort,
    /// First terminal child decides; siblings are canceled.
    Race,
}

impl ParallelStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::FailFast => "fail_fast",
            Self::BestEffort => "best_effort",
            Self::Race => "race",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "wait_all" => Some(Self::WaitAll),
            "fail_fast" => Some(Self::FailFast),
            "best_effort" => Some(Self::BestEffort),
            "race" => Some(Self::Race),
            _ => None,
        }
    }
}

/// Policy combining source outputs in an aggregate task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStrategy {
    /// Shallow merge by key; on collision the later source wins.
    #[default]
    Merge,
    /// `{key: [value, ...]}` in source order.
    Concat,
    /// Named reducer registered with the orchestrator context.
    Custom,
}

impl AggregateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Concat => "concat",
            Self::Custom => "custom",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "merge" => Some(Self::Merge),
            "concat" => Some(Self::Concat),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Success/error transition declared on a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Target task id; `None` halts the branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Input overrides handed to the target task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,
}

/// One route of a router task: a template condition and a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Template expression evaluated against the task output.
    pub when: String,
    /// Target task id when the condition is truthy.
    pub next: String,
}

/// Declarative, immutable description of a task in a workflow definition.
///
/// The struct is a flat superset of every task type's fields; the type tag
/// decides which are meaningful. `strategy` stays a raw string because the
/// same key names a [`ParallelStrategy`] on parallel tasks and an
/// [`AggregateStrategy`] on aggregate tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Stable id, unique within the workflow definition.
    pub id: String,

    #[serde(rename = "type", default)]
    pub task_type: TaskType,

    /// Action identifier handed to the executor.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    /// Input map; values may be templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,

    /// Environment overlay visible to templates as `task.env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Output transformation applied after success (deferred for parents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<TransitionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionConfig>,

    /// Nested children (parallel, composite).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskConfig>,

    /// Child template (collection).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Box<TaskConfig>>,

    /// Item source: inline list, template expression, or path into state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,

    /// Per-item filter expression with `item`/`index` in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Variable name the item is bound to (default `item`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,

    /// Variable name the index is bound to (default `index`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,

    /// Children created per cycle; 0 or unset creates all at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,

    /// Parallel or aggregate strategy, interpreted per task type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Signal name a wait task parks on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,

    /// When declared, incoming signals must carry this correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Wait timeout in seconds, enforced by the external runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Router routes, evaluated in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    /// Router default target when no route matches.
    #[serde(rename = "default", default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<String>,

    /// Aggregate source references (task ids).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Named reducer for the `custom` aggregate strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,

    /// Signal dispatch targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Whether a single target dispatch failure fails the signal task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_error: Option<bool>,

    /// Composite: whether a failed step fails the pipeline (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_on_fail: Option<bool>,
}

impl TaskConfig {
    /// Minimal config of the given type; fields are filled by builders.
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        Self { id: id.into(), task_type, ..Default::default() }
    }

    /// Parse a config from its declarative YAML form.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Set the action identifier.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Set the input map.
    pub fn with_input(mut self, with: Map<String, Value>) -> Self {
        self.with = Some(with);
        self
    }

    /// Append a nested child config (parallel/composite).
    pub fn with_child(mut self, child: TaskConfig) -> Self {
        self.tasks.push(child);
        self
    }

    /// Set the collection child template.
    pub fn with_template(mut self, template: TaskConfig) -> Self {
        self.task = Some(Box::new(template));
        self
    }

    /// Parallel strategy; defaults to `wait_all` when absent or unknown.
    pub fn parallel_strategy(&self) -> ParallelStrategy {
        self.strategy
            .as_deref()
            .and_then(ParallelStrategy::from_str)
            .unwrap_or_default()
    }

    /// Aggregate strategy; defaults to `merge` when absent or unknown.
    pub fn aggregate_strategy(&self) -> AggregateStrategy {
        self.strategy
            .as_deref()
            .and_then(AggregateStrategy::from_str)
            .unwrap_or_default()
    }

    /// Variable name items are bound to in collection children.
    pub fn item_var_name(&self) -> &str {
        self.item_var.as_deref().unwrap_or("item")
    }

    /// Variable name indices are bound to in collection children.
    pub fn index_var_name(&self) -> &str {
        self.index_var.as_deref().unwrap_or("index")
    }

    /// Composite failure policy (defaults to failing the pipeline).
    pub fn fails_on_step_error(&self) -> bool {
        self.error_on_fail.unwrap_or(true)
    }

    /// Validate structural requirements for the declared type.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("task id cannot be empty".to_string());
        }
        match self.task_type {
            TaskType::Parallel | TaskType::Composite if self.tasks.is_empty() => {
                Err(format!("{} task {} declares no children", self.task_type.as_str(), self.id))
            }
            TaskType::Collection if self.task.is_none() => {
                Err(format!("collection task {} declares no child template", self.id))
            }
            TaskType::Wait if self.wait_for.as_deref().unwrap_or("").is_empty() => {
                Err(format!("wait task {} declares no wait_for signal", self.id))
            }
            TaskType::Router if self.routes.is_empty() && self.default_route.is_none() => {
                Err(format!("router task {} declares no routes", self.id))
            }
            _ => Ok(()),
        }
    }
}
