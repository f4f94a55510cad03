//! Condition evaluation for step transitions.
//!
//! Pure functions over a form-data document. A missing (or null) field makes
//! a leaf condition false for every operator, negated ones included; missing
//! data is never an engine fault.

use serde_json::{Map, Value};

use crate::definition::types::{
    Condition, Connection, Logic, Operator, ProcessCondition, ProcessDefinition,
};

/// Evaluate a condition tree against `doc`.
pub fn evaluate(condition: &Condition, doc: &Map<String, Value>) -> bool {
    match condition {
        Condition::Rule(rule) => evaluate_rule(rule, doc),
        Condition::Group(group) => match group.logic {
            Logic::And => group.conditions.iter().all(|c| evaluate(c, doc)),
            Logic::Or => group.conditions.iter().any(|c| evaluate(c, doc)),
        },
    }
}

/// First connection leaving `step_id` whose condition holds. Unconditional
/// connections always hold; declared order decides.
pub fn select_connection<'a>(
    def: &'a ProcessDefinition,
    step_id: &str,
    doc: &Map<String, Value>,
) -> Option<&'a Connection> {
    def.connections.iter().filter(|c| c.from == step_id).find(|conn| {
        conn.condition
            .as_ref()
            .map_or(true, |cond| evaluate(cond, doc))
    })
}

fn evaluate_rule(rule: &ProcessCondition, doc: &Map<String, Value>) -> bool {
    let Some(left) = lookup(doc, &rule.field) else {
        return false;
    };
    let right = &rule.value;

    match rule.operator {
        Operator::Eq => values_equal(left, right),
        Operator::Ne => !values_equal(left, right),
        Operator::Gt => compare(left, right, |a, b| a > b),
        Operator::Lt => compare(left, right, |a, b| a < b),
        Operator::Gte => compare(left, right, |a, b| a >= b),
        Operator::Lte => compare(left, right, |a, b| a <= b),
        Operator::In => membership_list(right)
            .map(|list| list.iter().any(|item| values_equal(left, item)))
            .unwrap_or(false),
        Operator::NotIn => membership_list(right)
            .map(|list| !list.iter().any(|item| values_equal(left, item)))
            .unwrap_or(false),
        Operator::Contains => contains(left, right).unwrap_or(false),
        Operator::NotContains => contains(left, right).map(|c| !c).unwrap_or(false),
    }
}

/// Resolve a dotted path. Null counts as absent.
pub fn lookup<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

/// Coerce a JSON value to `f64`: numbers and numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// The candidate list of an `in`/`not_in` operand: a JSON array or a
/// comma-separated string.
pub fn membership_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect(),
        ),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    match (scalar_text(left), scalar_text(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// `None` when the field cannot contain anything (not a string or array).
fn contains(left: &Value, right: &Value) -> Option<bool> {
    match left {
        Value::String(haystack) => {
            let needle = scalar_text(right)?;
            Some(haystack.contains(needle.as_str()))
        }
        Value::Array(items) => Some(items.iter().any(|item| values_equal(item, right))),
        _ => None,
    }
}
