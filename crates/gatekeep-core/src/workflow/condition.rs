//! Trigger condition evaluation.
//!
//! A [`TriggerCondition`] is a small predicate tree evaluated against the
//! entity data carried by a trigger. Evaluation is pure: no I/O, no clock.
//!
//! Comparison rules:
//! - field paths are dot-separated; numeric segments index into arrays
//! - a missing or null field fails every comparison except `ne`
//! - when either side is a JSON number, numeric strings on the other side
//!   are coerced (`"12000.50"` compares as `12000.5`)
//! - ordering between two strings is lexicographic, which sorts ISO-8601
//!   dates correctly

use std::cmp::Ordering;

use gatekeep_types::template::{CompareOp, TriggerCondition};
use serde_json::Value;

/// Evaluate `condition` against `data`.
pub fn evaluate(condition: &TriggerCondition, data: &Value) -> bool {
    match condition {
        TriggerCondition::All { all } => all.iter().all(|c| evaluate(c, data)),
        TriggerCondition::Any { any } => any.iter().any(|c| evaluate(c, data)),
        TriggerCondition::Not { not } => !evaluate(not, data),
        TriggerCondition::Compare { field, op, value } => compare(lookup(data, field), *op, value),
    }
}

/// Structural problems in a condition tree, as human-readable violations.
///
/// Unknown field names are not a violation: entity payloads vary between
/// source systems and a missing field simply evaluates to false.
pub fn condition_violations(condition: &TriggerCondition) -> Vec<String> {
    let mut violations = Vec::new();
    collect_violations(condition, &mut violations);
    violations
}

fn collect_violations(condition: &TriggerCondition, out: &mut Vec<String>) {
    match condition {
        TriggerCondition::All { all: children } | TriggerCondition::Any { any: children } => {
            if children.is_empty() {
                out.push("trigger condition group must not be empty".to_string());
            }
            for child in children {
                collect_violations(child, out);
            }
        }
        TriggerCondition::Not { not } => collect_violations(not, out),
        TriggerCondition::Compare { field, op, value } => {
            if field.trim().is_empty() || field.split('.').any(str::is_empty) {
                out.push(format!("trigger condition has an invalid field path '{field}'"));
            }
            if *op == CompareOp::In && !value.is_array() {
                out.push(format!("operator 'in' on '{field}' requires an array value"));
            }
        }
    }
}

/// Resolve a dot-separated path.
pub(crate) fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn compare(actual: Option<&Value>, op: CompareOp, expected: &Value) -> bool {
    let actual = match actual {
        None | Some(Value::Null) => return op == CompareOp::Ne && !expected.is_null(),
        Some(v) => v,
    };

    match op {
        CompareOp::Exists => true,
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => ordering(actual, expected) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::In => expected
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| values_equal(actual, c))),
        CompareOp::Contains => match actual {
            Value::String(s) => expected.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    a == b
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_number() || b.is_number() {
        return as_number(a)?.partial_cmp(&as_number(b)?);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
