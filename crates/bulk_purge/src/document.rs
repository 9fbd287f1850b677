//! Document evaluation shared by the bundled store backends: filter matching,
//! cross-type value ordering, and the windowed bucket aggregation.
//!
//! This is store-side logic. The purge engine itself never calls into here.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::store::{BucketRow, Filter, RecordId};

/// String comparison rules requested through the `collation` option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Collation {
    #[default]
    Simple,
    CaseInsensitive,
}

impl Collation {
    pub fn parse(raw: Option<&str>) -> Result<Self, StoreError> {
        match raw.map(str::trim) {
            None | Some("") | Some("simple") => Ok(Self::Simple),
            Some("case_insensitive") | Some("ci") => Ok(Self::CaseInsensitive),
            Some(other) => Err(StoreError::InvalidFilter(format!(
                "unsupported collation {other:?}"
            ))),
        }
    }
}

/// Rank of a value's type in the store's default cross-type ordering.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: null < numbers < strings < objects < arrays < booleans.
pub fn compare_values(a: &Value, b: &Value, collation: Collation) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => match collation {
            Collation::Simple => x.cmp(y),
            Collation::CaseInsensitive => x.to_lowercase().cmp(&y.to_lowercase()),
        },
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk
                    .cmp(yk)
                    .then_with(|| compare_values(xv, yv, collation));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = compare_values(xv, yv, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Resolve a dotted field path. `_id` resolves to the record id.
/// Missing fields read as `null`.
pub fn lookup(id: &RecordId, doc: &Map<String, Value>, path: &str) -> Value {
    if path == "_id" {
        return Value::String(id.as_str().to_string());
    }
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Value::Null;
    };
    let mut current = match doc.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for part in parts {
        current = match current.get(part) {
            Some(value) => value,
            None => return Value::Null,
        };
    }
    current.clone()
}

fn field_exists(doc: &Map<String, Value>, path: &str) -> bool {
    if path == "_id" {
        return true;
    }
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return false;
    };
    let mut current = match doc.get(first) {
        Some(value) => value,
        None => return false,
    };
    for part in parts {
        current = match current.get(part) {
            Some(value) => value,
            None => return false,
        };
    }
    true
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Evaluate `filter` against one document.
///
/// Supported: equality on dotted paths, and operator objects using
/// `$eq $ne $gt $gte $lt $lte $in $nin $exists`. Range operators only
/// match values of the same type class.
pub fn matches(
    id: &RecordId,
    doc: &Map<String, Value>,
    filter: &Filter,
    collation: Collation,
) -> Result<bool, StoreError> {
    for (field, cond) in filter.fields() {
        if field.starts_with('$') {
            return Err(StoreError::InvalidFilter(format!(
                "top-level operator {field} is not supported"
            )));
        }
        let value = lookup(id, doc, field);
        let ok = match cond {
            Value::Object(ops) if is_operator_object(cond) => {
                let mut all = true;
                for (op, operand) in ops {
                    if !eval_operator(doc, field, &value, op, operand, collation)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            _ => compare_values(&value, cond, collation) == Ordering::Equal,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_operator(
    doc: &Map<String, Value>,
    field: &str,
    value: &Value,
    op: &str,
    operand: &Value,
    collation: Collation,
) -> Result<bool, StoreError> {
    let same_class = type_rank(value) == type_rank(operand);
    let ord = compare_values(value, operand, collation);
    let result = match op {
        "$eq" => ord == Ordering::Equal,
        "$ne" => ord != Ordering::Equal,
        "$gt" => same_class && ord == Ordering::Greater,
        "$gte" => same_class && ord != Ordering::Less,
        "$lt" => same_class && ord == Ordering::Less,
        "$lte" => same_class && ord != Ordering::Greater,
        "$in" | "$nin" => {
            let Value::Array(candidates) = operand else {
                return Err(StoreError::InvalidFilter(format!(
                    "{op} on {field} needs an array"
                )));
            };
            let found = candidates
                .iter()
                .any(|c| compare_values(value, c, collation) == Ordering::Equal);
            if op == "$in" {
                found
            } else {
                !found
            }
        }
        "$exists" => {
            let Value::Bool(want) = operand else {
                return Err(StoreError::InvalidFilter(format!(
                    "$exists on {field} needs a boolean"
                )));
            };
            field_exists(doc, field) == *want
        }
        other => {
            return Err(StoreError::InvalidFilter(format!(
                "unknown operator {other} on {field}"
            )))
        }
    };
    Ok(result)
}

/// Sort candidates by `(sort value, id)` and annotate them with bucket
/// windows, the way the store's `$setWindowFields` stage does.
pub fn window_rows(
    mut candidates: Vec<(Value, RecordId)>,
    bucket_size: usize,
    collation: Collation,
) -> Vec<BucketRow> {
    let size = bucket_size.max(1) as u64;
    candidates.sort_by(|(av, aid), (bv, bid)| {
        compare_values(av, bv, collation).then_with(|| aid.cmp(bid))
    });
    let total = candidates.len() as u64;
    candidates
        .into_iter()
        .enumerate()
        .map(|(idx, (sort_value, record_id))| {
            let ordinal = idx as u64 + 1;
            let bucket_id = ordinal.div_ceil(size);
            let bucket_start = (bucket_id - 1) * size;
            BucketRow {
                record_id,
                sort_value,
                bucket_id,
                running_count: ordinal - bucket_start,
                bucket_total: size.min(total - bucket_start),
            }
        })
        .collect()
}
