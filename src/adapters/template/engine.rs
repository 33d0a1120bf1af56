//! Reference template engine.
//!
//! Resolves `{{ path.through.variables }}` references and flat comparison
//! expressions against a variable map. The engine is deliberately small: the
//! core treats template evaluation as an opaque pure function, and this
//! implementation exists so the crate is runnable and testable without an
//! external engine. It is deterministic and performs no I/O.

use serde_json::{Map, Value};

use crate::domain::errors::{OrchResult, OrchestrationError};
use crate::domain::ports::{TemplateEngine, VariableMap};

/// Pure path-and-comparison evaluator over the variable map.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTemplateEngine;

impl PathTemplateEngine {
    pub fn new() -> Self {
        Self
    }

    fn parse_string(&self, s: &str, ctx: &VariableMap) -> OrchResult<Value> {
        let trimmed = s.trim();

        // Whole-string reference: the referenced value replaces the string,
        // preserving its type.
        if let Some(inner) = single_reference(trimmed) {
            let value = self.evaluate(inner, ctx)?;
            if value.is_null() && resolve_path(inner, ctx).is_none() && !is_expression(inner) {
                return Err(OrchestrationError::Template(format!(
                    "unresolved template reference: {inner}"
                )));
            }
            return Ok(value);
        }

        // Embedded references interpolate as strings.
        if !s.contains("{{") {
            return Ok(Value::String(s.to_string()));
        }
        let mut out = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let Some(end) = rest[start..].find("}}") else {
                return Err(OrchestrationError::Template(format!(
                    "unterminated template in: {s}"
                )));
            };
            out.push_str(&rest[..start]);
            let expr = rest[start + 2..start + end].trim();
            let value = self.evaluate(expr, ctx)?;
            if value.is_null() && resolve_path(expr, ctx).is_none() && !is_expression(expr) {
                return Err(OrchestrationError::Template(format!(
                    "unresolved template reference: {expr}"
                )));
            }
            out.push_str(&stringify(&value));
            rest = &rest[start + end + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

impl TemplateEngine for PathTemplateEngine {
    fn parse_any(&self, value: &Value, ctx: &VariableMap) -> OrchResult<Value> {
        match value {
            Value::String(s) => self.parse_string(s, ctx),
            Value::Array(items) => items
                .iter()
                .map(|item| self.parse_any(item, ctx))
                .collect::<OrchResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.parse_any(item, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn parse_map_with_filter(
        &self,
        map: &Map<String, Value>,
        ctx: &VariableMap,
        deferred: &dyn Fn(&str) -> bool,
    ) -> OrchResult<Map<String, Value>> {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            if deferred(key) {
                out.insert(key.clone(), value.clone());
            } else {
                out.insert(key.clone(), self.parse_any(value, ctx)?);
            }
        }
        Ok(out)
    }

    fn evaluate(&self, expr: &str, ctx: &VariableMap) -> OrchResult<Value> {
        let expr = expr.trim();
        if let Some((lhs, op, rhs)) = split_comparison(expr) {
            let lhs = operand(lhs, ctx);
            let rhs = operand(rhs, ctx);
            return Ok(Value::Bool(compare(&lhs, op, &rhs)));
        }
        Ok(operand(expr, ctx))
    }
}

/// `{{ expr }}` with nothing around it.
fn single_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") {
        return None;
    }
    Some(inner.trim())
}

fn is_expression(s: &str) -> bool {
    split_comparison(s).is_some() || literal(s).is_some()
}

/// Split `lhs op rhs` on the first comparison operator outside quotes.
fn split_comparison(expr: &str) -> Option<(&str, &str, &str)> {
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        let mut in_quote = None;
        let bytes = expr.as_bytes();
        let mut i = 0;
        while i + op.len() <= bytes.len() {
            let c = bytes[i] as char;
            match (in_quote, c) {
                (Some(q), _) if c == q => in_quote = None,
                (None, '\'' | '"') => in_quote = Some(c),
                (None, _) if expr[i..].starts_with(op) => {
                    return Some((expr[..i].trim(), op, expr[i + op.len()..].trim()));
                }
                _ => {}
            }
            i += 1;
        }
    }
    None
}

/// Resolve an operand: literal first, then path lookup (missing → null).
fn operand(token: &str, ctx: &VariableMap) -> Value {
    if let Some(value) = literal(token) {
        return value;
    }
    resolve_path(token, ctx).unwrap_or(Value::Null)
}

fn literal(token: &str) -> Option<Value> {
    match token {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
        || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
    {
        return Some(Value::String(token[1..token.len() - 1].to_string()));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    if let Ok(f) = token.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    None
}

/// Walk a dotted path (with `[n]` index segments) through the variable map.
fn resolve_path(path: &str, ctx: &VariableMap) -> Option<Value> {
    let mut current = Value::Object(ctx.clone());
    for segment in path.split('.') {
        let (key, indexes) = split_indexes(segment)?;
        if !key.is_empty() {
            current = current.get(key)?.clone();
        }
        for idx in indexes {
            current = current.get(idx)?.clone();
        }
    }
    Some(current)
}

/// `records[0][1]` → (`records`, `[0, 1]`).
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..bracket];
    let mut indexes = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let end = stripped.find(']')?;
        indexes.push(stripped[..end].parse().ok()?);
        rest = &stripped[end + 1..];
    }
    if rest.is_empty() {
        Some((key, indexes))
    } else {
        None
    }
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    match op {
        "==" => loose_eq(lhs, rhs),
        "!=" => !loose_eq(lhs, rhs),
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(l), Some(r)) => match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                "<=" => l <= r,
                _ => false,
            },
            _ => false,
        },
    }
}

/// Equality that tolerates number/string representation differences coming
/// out of template interpolation.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    match (as_number(lhs), as_number(rhs)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::is_truthy;
    use serde_json::json;

    fn ctx() -> VariableMap {
        let value = json!({
            "workflow": {"id": "wf", "input": {"region": "eu"}},
            "tasks": {
                "fetch": {"output": {"records": [{"v": 1}, {"v": 2}], "count": 2}}
            },
            "item": {"v": 2},
            "index": 1,
        });
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_whole_string_reference_preserves_type() {
        let engine = PathTemplateEngine::new();
        let parsed = engine
            .parse_any(&json!("{{ tasks.fetch.output.records }}"), &ctx())
            .unwrap();
        assert_eq!(parsed, json!([{"v": 1}, {"v": 2}]));

        let parsed = engine.parse_any(&json!("{{ tasks.fetch.output.count }}"), &ctx()).unwrap();
        assert_eq!(parsed, json!(2));
    }

    #[test]
    fn test_interpolation_stringifies() {
        let engine = PathTemplateEngine::new();
        let parsed = engine
            .parse_any(&json!("region={{ workflow.input.region }} n={{ index }}"), &ctx())
            .unwrap();
        assert_eq!(parsed, json!("region=eu n=1"));
    }

    #[test]
    fn test_indexed_path() {
        let engine = PathTemplateEngine::new();
        let parsed = engine
            .parse_any(&json!("{{ tasks.fetch.output.records[1].v }}"), &ctx())
            .unwrap();
        assert_eq!(parsed, json!(2));
    }

    #[test]
    fn test_recursion_into_arrays_and_objects() {
        let engine = PathTemplateEngine::new();
        let parsed = engine
            .parse_any(
                &json!({"a": ["{{ index }}", {"b": "{{ item.v }}"}], "c": 7}),
                &ctx(),
            )
            .unwrap();
        assert_eq!(parsed, json!({"a": [1, {"b": 2}], "c": 7}));
    }

    #[test]
    fn test_unresolved_reference_errors() {
        let engine = PathTemplateEngine::new();
        let err = engine.parse_any(&json!("{{ tasks.nope.output }}"), &ctx()).unwrap_err();
        assert!(matches!(err, OrchestrationError::Template(_)));
    }

    #[test]
    fn test_parse_map_with_filter_defers_keys() {
        let engine = PathTemplateEngine::new();
        let map = match json!({
            "with": {"v": "{{ item.v }}"},
            "outputs": {"v": "{{ item.v }}"},
        }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };

        let parsed = engine
            .parse_map_with_filter(&map, &ctx(), &|key| key == "outputs")
            .unwrap();
        assert_eq!(parsed["with"], json!({"v": 2}));
        // Deferred key stays verbatim
        assert_eq!(parsed["outputs"], json!({"v": "{{ item.v }}"}));
    }

    #[test]
    fn test_evaluate_comparisons() {
        let engine = PathTemplateEngine::new();
        let c = ctx();
        assert_eq!(engine.evaluate("item.v > 1", &c).unwrap(), json!(true));
        assert_eq!(engine.evaluate("item.v > 2", &c).unwrap(), json!(false));
        assert_eq!(engine.evaluate("item.v == 2", &c).unwrap(), json!(true));
        assert_eq!(engine.evaluate("workflow.input.region == 'eu'", &c).unwrap(), json!(true));
        assert_eq!(engine.evaluate("workflow.input.region != 'us'", &c).unwrap(), json!(true));
        // Missing paths compare as null: ordered comparisons are false
        assert_eq!(engine.evaluate("item.missing > 0", &c).unwrap(), json!(false));
    }

    #[test]
    fn test_evaluate_bare_path_truthiness() {
        let engine = PathTemplateEngine::new();
        let c = ctx();
        assert!(is_truthy(&engine.evaluate("item.v", &c).unwrap()));
        assert!(!is_truthy(&engine.evaluate("item.missing", &c).unwrap()));
    }

    #[test]
    fn test_quoted_operator_not_split() {
        let engine = PathTemplateEngine::new();
        let c = ctx();
        assert_eq!(
            engine.evaluate("workflow.input.region == 'a>b'", &c).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_determinism() {
        let engine = PathTemplateEngine::new();
        let c = ctx();
        let template = json!({"a": "{{ item.v }}", "b": "{{ index }} of {{ tasks.fetch.output.count }}"});
        let first = engine.parse_any(&template, &c).unwrap();
        let second = engine.parse_any(&template, &c).unwrap();
        assert_eq!(first, second);
    }
}
