//! Decision Conditions
//!
//! A Decision step asks a [`ConditionEvaluator`] about each of its cases in
//! declaration order. The built-in [`ComparisonEvaluator`] understands a
//! small expression language over the step's resolved input:
//!
//! ```text
//! approved                  truthiness of a parameter
//! amount > 100              numeric or string comparison
//! status == "shipped"       equality (`=` is accepted too)
//! region in ["eu", "us"]    membership in a JSON array
//! order.total >= 10         dotted paths into objects
//! ```
//!
//! The right-hand side is read as JSON and falls back to a bare string.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{EngineError, Result};

pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates `condition` against the resolved step input.
    fn evaluate(&self, condition: &str, parameters: &HashMap<String, Value>) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for ComparisonEvaluator {
    fn evaluate(&self, condition: &str, parameters: &HashMap<String, Value>) -> Result<bool> {
        let condition = condition.trim();
        if condition.is_empty() {
            return Err(EngineError::Parse("empty condition".to_string()));
        }

        let Some((left, operator, right)) = split_condition(condition) else {
            return Ok(truthy(&lookup(parse_path(condition, condition)?, parameters)));
        };

        let actual = lookup(parse_path(left, condition)?, parameters);
        if right.is_empty() {
            return Err(EngineError::Parse(format!(
                "condition '{}' has no value to compare against",
                condition
            )));
        }
        let expected = parse_literal(right);

        let result = match operator {
            Operator::Eq => values_equal(&actual, &expected),
            Operator::Ne => !values_equal(&actual, &expected),
            Operator::Gt => compare(&actual, &expected) == Some(Ordering::Greater),
            Operator::Lt => compare(&actual, &expected) == Some(Ordering::Less),
            Operator::Ge => matches!(compare(&actual, &expected), Some(Ordering::Greater | Ordering::Equal)),
            Operator::Le => matches!(compare(&actual, &expected), Some(Ordering::Less | Ordering::Equal)),
            Operator::In => match &expected {
                Value::Array(items) => items.iter().any(|item| values_equal(&actual, item)),
                _ => {
                    return Err(EngineError::Parse(format!(
                        "condition '{}': 'in' needs a JSON array",
                        condition
                    )))
                }
            },
        };
        Ok(result)
    }
}

/// Finds the first operator and splits around it.
fn split_condition(condition: &str) -> Option<(&str, Operator, &str)> {
    let bytes = condition.as_bytes();

    for (i, c) in condition.char_indices() {
        let two = condition.get(i..i + 2).unwrap_or("");
        let operator = match two {
            "==" => Some((Operator::Eq, 2)),
            "!=" => Some((Operator::Ne, 2)),
            ">=" => Some((Operator::Ge, 2)),
            "<=" => Some((Operator::Le, 2)),
            _ => match c {
                '=' => Some((Operator::Eq, 1)),
                '>' => Some((Operator::Gt, 1)),
                '<' => Some((Operator::Lt, 1)),
                _ => None,
            },
        };
        if let Some((operator, width)) = operator {
            return Some((condition[..i].trim(), operator, condition[i + width..].trim()));
        }

        let keyword = i > 0
            && bytes[i - 1].is_ascii_whitespace()
            && condition[i..].starts_with("in")
            && condition[i + 2..].starts_with(|ch: char| ch.is_whitespace() || ch == '[');
        if keyword {
            return Some((condition[..i].trim(), Operator::In, condition[i + 2..].trim()));
        }
    }

    None
}

fn parse_path<'a>(path: &'a str, condition: &str) -> Result<Vec<&'a str>> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(path.split('.').collect())
    } else {
        Err(EngineError::Parse(format!(
            "cannot parse condition '{}': '{}' is not a parameter name",
            condition, path
        )))
    }
}

fn lookup(path: Vec<&str>, parameters: &HashMap<String, Value>) -> Value {
    let mut segments = path.into_iter();
    let Some(first) = segments.next() else {
        return Value::Null;
    };

    let mut current = parameters.get(first).unwrap_or(&Value::Null);
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index))
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current.clone()
}

fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| {
        let unquoted = raw
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .unwrap_or(raw);
        Value::String(unquoted.to_string())
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
