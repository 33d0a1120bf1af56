//! Parent-chain context traversal.
//!
//! Builds the nested `parent` variable a template sees: one frame per
//! ancestor, linked through `parent` keys, combining the ancestor's config
//! fields with runtime fields from its state. Traversal is cycle-safe (an
//! in-band marker replaces a revisited task) and bounded by the process-wide
//! parent-depth limit.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use serde_json::{Map, Value};

use crate::domain::models::{TaskConfig, TaskState};

/// Marker message for a task revisited along the parent chain.
pub const PARENT_CYCLE_ERROR: &str = "circular reference detected in parent chain";

/// Marker message for a task revisited along the children chain.
pub const CHILDREN_CYCLE_ERROR: &str = "circular reference detected in children chain";

/// Cache-clear threshold: below this hit ratio the whole cache is dropped at
/// workflow boundaries instead of evicting per tag.
const MIN_HIT_RATIO: f64 = 0.5;

/// Default bound on cached parent contexts.
const PARENT_CACHE_CAPACITY: u64 = 1024;

/// Resolves configs and states while walking up the parent chain.
///
/// Lookup strategy mirrors the repository data: first through runtime state
/// linkage (`parent_exec_id`), then a structural walk of the workflow config
/// tree. A missing referenced entity produces an in-band error frame, never
/// a silent absence.
pub struct ParentLookup<'a> {
    pub workflow_id: &'a str,
    pub workflow_exec_id: &'a str,
    /// Maximum chain frames above the task itself, read once per context
    /// build from the process-wide limits.
    pub max_parent_depth: usize,
    /// State of each task, keyed by task id (latest execution wins).
    pub state_by_task: &'a dyn Fn(&str) -> Option<&'a TaskState>,
    /// Config lookup by task id.
    pub config_by_id: &'a dyn Fn(&str) -> Option<&'a TaskConfig>,
    /// Structural parent lookup through the workflow config tree.
    pub structural_parent: &'a dyn Fn(&str) -> Option<&'a TaskConfig>,
    /// Parent resolution through state linkage: child task id → parent task id.
    pub linked_parent: &'a dyn Fn(&str) -> Option<String>,
}

/// Size-bounded LRU of parent-context frames, tagged by workflow execution.
///
/// Entries are keyed `(workflow_id, workflow_exec_id, task_id)`; the tag
/// prefix lets a workflow boundary evict exactly its own entries. When the
/// hit ratio degrades below [`MIN_HIT_RATIO`], the boundary clears the cache
/// wholesale instead.
pub struct ParentContextCache {
    cache: Cache<String, Arc<Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ParentContextCache {
    fn default() -> Self {
        Self::with_capacity(PARENT_CACHE_CAPACITY)
    }
}

impl ParentContextCache {
    pub fn with_capacity(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .support_invalidation_closures()
            .build();
        Self { cache, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    fn key(&self, workflow_id: &str, workflow_exec_id: &str, task_id: &str) -> String {
        format!("{workflow_id}\u{1}{workflow_exec_id}\u{1}{task_id}")
    }

    fn get(&self, key: &str) -> Option<Arc<Value>> {
        match self.cache.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, key: String, value: Arc<Value>) {
        self.cache.insert(key, value);
    }

    /// Observed hit ratio since the last wholesale clear.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            hits as f64 / total as f64
        }
    }

    /// Workflow-boundary maintenance: evict this workflow execution's tag,
    /// or clear wholesale when the hit ratio has degraded.
    pub fn end_workflow(&self, workflow_id: &str, workflow_exec_id: &str) {
        if self.hit_ratio() < MIN_HIT_RATIO {
            tracing::debug!(
                workflow_id,
                workflow_exec_id,
                hit_ratio = self.hit_ratio(),
                "Clearing parent-context cache (hit ratio below threshold)"
            );
            self.cache.invalidate_all();
            self.hits.store(0, Ordering::Relaxed);
            self.misses.store(0, Ordering::Relaxed);
            return;
        }
        let prefix = format!("{workflow_id}\u{1}{workflow_exec_id}\u{1}");
        // Closure-based invalidation keeps other workflows' entries warm.
        let _ = self.cache.invalidate_entries_if(move |key, _| key.starts_with(&prefix));
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// One frame of the parent chain: config fields plus runtime fields.
pub fn parent_frame(config: &TaskConfig, state: Option<&TaskState>) -> Value {
    let mut frame = Map::new();
    frame.insert("id".to_string(), Value::String(config.id.clone()));
    frame.insert("type".to_string(), Value::String(config.task_type.as_str().to_string()));
    if !config.action.is_empty() {
        frame.insert("action".to_string(), Value::String(config.action.clone()));
    }
    if let Some(env) = &config.env {
        if let Ok(env) = serde_json::to_value(env) {
            frame.insert("env".to_string(), env);
        }
    }
    if let Some(with) = &config.with {
        frame.insert("with".to_string(), Value::Object(with.clone()));
    }
    if let Some(state) = state {
        if let Some(input) = &state.input {
            frame.insert("input".to_string(), Value::Object(input.clone()));
        }
        if let Some(output) = &state.output {
            frame.insert("output".to_string(), output.clone());
        }
        frame.insert("status".to_string(), Value::String(state.status.as_str().to_string()));
        if let Some(error) = &state.error {
            if let Ok(error) = serde_json::to_value(error) {
                frame.insert("error".to_string(), error);
            }
        }
    }
    Value::Object(frame)
}

/// In-band marker frame for a broken or cyclic chain.
fn error_frame(task_id: &str, message: &str) -> Value {
    let mut frame = Map::new();
    frame.insert("id".to_string(), Value::String(task_id.to_string()));
    frame.insert("error".to_string(), Value::String(message.to_string()));
    Value::Object(frame)
}

/// Build the parent context of `config`, recursing toward the root.
///
/// Termination, in order: missing config or depth at the limit ends the
/// chain silently; a revisited task id yields a cycle marker; a cache hit
/// short-circuits; otherwise the frame is built, the grandparent resolved
/// (state linkage first, structural walk second), and the result cached.
pub fn build_parent_context(
    cache: &ParentContextCache,
    lookup: &ParentLookup<'_>,
    config: Option<&TaskConfig>,
    depth: usize,
    visited: &BTreeSet<String>,
) -> Option<Value> {
    let config = config?;
    if depth >= lookup.max_parent_depth {
        return None;
    }
    if visited.contains(&config.id) {
        return Some(error_frame(&config.id, PARENT_CYCLE_ERROR));
    }

    let key = cache.key(lookup.workflow_id, lookup.workflow_exec_id, &config.id);
    if let Some(cached) = cache.get(&key) {
        return Some((*cached).clone());
    }

    // Per-call copy of the visited set: sibling subtrees must not see each
    // other's marks.
    let mut visited = visited.clone();
    visited.insert(config.id.clone());

    let state = (lookup.state_by_task)(&config.id);
    let mut frame = parent_frame(config, state);

    let grandparent = resolve_grandparent(lookup, config);
    if let Some(grandparent) = grandparent {
        if let Some(parent_value) =
            build_parent_context(cache, lookup, Some(grandparent), depth + 1, &visited)
        {
            if let Value::Object(map) = &mut frame {
                map.insert("parent".to_string(), parent_value);
            }
        }
    }

    cache.insert(key, Arc::new(frame.clone()));
    Some(frame)
}

/// Find the config of `config`'s parent: runtime state linkage first, then
/// the structural config walk.
fn resolve_grandparent<'a>(
    lookup: &ParentLookup<'a>,
    config: &TaskConfig,
) -> Option<&'a TaskConfig> {
    if let Some(parent_task_id) = (lookup.linked_parent)(&config.id) {
        if let Some(parent_config) = (lookup.config_by_id)(&parent_task_id) {
            return Some(parent_config);
        }
        if let Some(parent_config) = (lookup.structural_parent)(&config.id) {
            return Some(parent_config);
        }
        return None;
    }
    (lookup.structural_parent)(&config.id)
}
