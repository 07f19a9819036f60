//! The Query Engine's predicate evaluator: a fixed operator vocabulary
//! over dotted field paths, conjunctive across fields, with an
//! optional `$limit` on the number of documents emitted.

use serde_json::Value;

use tether_core::document::{get_path, Document};

const LIMIT_FIELD: &str = "$limit";

/// Extracts the top-level `$limit` bound from a predicate, if present.
#[must_use]
pub fn limit_of(predicate: &Document) -> Option<usize> {
    predicate
        .get(LIMIT_FIELD)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
}

/// Evaluates `predicate` against `document`. Every field predicate is
/// conjunctive; `$limit` is consumed by the caller, not by this
/// function.
#[must_use]
pub fn matches(predicate: &Document, document: &Document) -> bool {
    predicate
        .iter()
        .filter(|(field, _)| field.as_str() != LIMIT_FIELD)
        .all(|(path, operand)| matches_field(document, path, operand))
}

fn matches_field(document: &Document, path: &str, operand: &Value) -> bool {
    match operand {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, operand)| matches_operator(document, path, op, operand)),
        scalar => get_path(document, path) == Some(scalar),
    }
}

fn matches_operator(document: &Document, path: &str, op: &str, operand: &Value) -> bool {
    let field = get_path(document, path);
    match op {
        "$eq" => field == Some(operand),
        "$ne" => match field {
            None => !operand.is_null(),
            Some(value) => value != operand,
        },
        "$gt" => numeric_compare(field, operand, |a, b| a > b),
        "$gte" => numeric_compare(field, operand, |a, b| a >= b),
        "$lt" => numeric_compare(field, operand, |a, b| a < b),
        "$lte" => numeric_compare(field, operand, |a, b| a <= b),
        "$in" => {
            let Some(field) = field else {
                return false;
            };
            operand
                .as_array()
                .is_some_and(|candidates| candidates.contains(field))
        }
        "$contains" => match field {
            Some(Value::Array(items)) => items.contains(operand),
            Some(Value::String(text)) => {
                operand.as_str().is_some_and(|needle| text.contains(needle))
            }
            _ => false,
        },
        "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
        _ => false, // unrecognised operator: fails the predicate rather than panicking
    }
}

fn numeric_compare(
    field: Option<&Value>,
    operand: &Value,
    compare: impl Fn(f64, f64) -> bool,
) -> bool {
    let (Some(field), Some(operand)) = (field.and_then(Value::as_f64), operand.as_f64()) else {
        return false;
    };
    compare(field, operand)
}
