//! Template engine façade.

use serde_json::{Map, Value};

use crate::domain::errors::OrchResult;

/// The variable map templates evaluate against: `{workflow, tasks, task,
/// parent, current, item?, index?, state?}`.
pub type VariableMap = Map<String, Value>;

/// Opaque evaluator for templated config.
///
/// Pure and referentially transparent: identical inputs produce identical
/// outputs, and evaluation performs no I/O. The engine itself is a
/// collaborator boundary; the core ships a reference implementation under
/// `adapters::template`.
pub trait TemplateEngine: Send + Sync {
    /// Evaluate templates anywhere inside `value` (recursing through arrays
    /// and objects) against the variable map.
    fn parse_any(&self, value: &Value, ctx: &VariableMap) -> OrchResult<Value>;

    /// Evaluate a map's values, leaving entries verbatim where `deferred`
    /// returns true for the key. Deferred keys hold templates that must
    /// resolve lazily (child configs, output transformations).
    fn parse_map_with_filter(
        &self,
        map: &Map<String, Value>,
        ctx: &VariableMap,
        deferred: &dyn Fn(&str) -> bool,
    ) -> OrchResult<Map<String, Value>>;

    /// Evaluate a standalone expression (route conditions, collection
    /// filters) to a value.
    fn evaluate(&self, expr: &str, ctx: &VariableMap) -> OrchResult<Value>;
}

/// Truthiness convention shared by route conditions and filters.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
