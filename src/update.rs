use chrono::Utc;

use crate::context::Options;
use crate::error::{Error, Result};
use crate::path::{remove_value, resolve, set_value};
use crate::query::Query;
use crate::value::{Document, Value};

/// Apply all update operators in `update` to `doc`, returning the paths that
/// actually changed.
///
/// `update` must be an object whose keys are operator names (`$set`, `$inc`,
/// etc.) and whose values map field paths to operands. Operators run in the
/// order given.
pub fn apply_update(doc: &mut Value, update: &Value) -> Result<Vec<String>> {
    apply_update_with(doc, update, &Options::default())
}

/// Like [`apply_update`], with the options used to compile `$pull` conditions.
pub fn apply_update_with(doc: &mut Value, update: &Value, options: &Options) -> Result<Vec<String>> {
    if !doc.is_object() {
        return Err(Error::NotAnObject);
    }
    let obj = update
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("update must be an object".into()))?;

    let mut modified = Vec::new();
    for (op, fields) in obj {
        let fields = fields
            .as_object()
            .ok_or_else(|| Error::InvalidQuery(format!("{op} value must be an object")))?;
        for (path, operand) in fields {
            let changed = match op.as_str() {
                "$set" => set(doc, path, operand),
                "$unset" => unset(doc, path),
                "$inc" => inc(doc, path, operand)?,
                "$mul" => mul(doc, path, operand)?,
                "$min" => bound(doc, path, operand, std::cmp::Ordering::Less),
                "$max" => bound(doc, path, operand, std::cmp::Ordering::Greater),
                "$rename" => rename(doc, path, operand, &mut modified)?,
                "$currentDate" => set(doc, path, &Value::Date(Utc::now().timestamp_millis())),
                "$push" => push(doc, path, operand)?,
                "$pull" => pull(doc, path, operand, options)?,
                "$addToSet" => add_to_set(doc, path, operand)?,
                "$pop" => pop(doc, path, operand)?,
                _ => {
                    return Err(Error::InvalidQuery(format!(
                        "unknown update operator: {op}"
                    )))
                }
            };
            if changed && !modified.contains(path) {
                modified.push(path.clone());
            }
        }
    }
    Ok(modified)
}

// ---------------------------------------------------------------------------
// Field operators
// ---------------------------------------------------------------------------

fn set(doc: &mut Value, path: &str, value: &Value) -> bool {
    if resolve(doc, path).as_ref() == Some(value) {
        return false;
    }
    set_value(doc, path, value.clone());
    true
}

fn unset(doc: &mut Value, path: &str) -> bool {
    if resolve(doc, path).is_none() {
        return false;
    }
    remove_value(doc, path);
    true
}

fn numeric_operand(op: &str, path: &str, operand: &Value) -> Result<()> {
    if operand.is_number() {
        Ok(())
    } else {
        Err(Error::InvalidQuery(format!(
            "{op} value for '{path}' must be numeric"
        )))
    }
}

fn numeric_field(op: &str, path: &str, current: Option<Value>) -> Result<Option<Value>> {
    match current {
        None => Ok(None),
        Some(v) if v.is_number() => Ok(Some(v)),
        Some(_) => Err(Error::evaluation(
            op,
            format!("cannot apply to non-numeric field '{path}'"),
        )),
    }
}

fn inc(doc: &mut Value, path: &str, operand: &Value) -> Result<bool> {
    numeric_operand("$inc", path, operand)?;
    let next = match numeric_field("$inc", path, resolve(doc, path))? {
        None => operand.clone(),
        Some(Value::Int(a)) => match (operand, a) {
            (Value::Int(b), a) => a
                .checked_add(*b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 + *b as f64)),
            (other, a) => Value::Float(a as f64 + other.as_f64().unwrap_or(0.0)),
        },
        Some(current) => {
            Value::Float(current.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0))
        }
    };
    Ok(set(doc, path, &next))
}

fn mul(doc: &mut Value, path: &str, operand: &Value) -> Result<bool> {
    numeric_operand("$mul", path, operand)?;
    let next = match (numeric_field("$mul", path, resolve(doc, path))?, operand) {
        (None, Value::Int(_)) => Value::Int(0),
        (None, _) => Value::Float(0.0),
        (Some(Value::Int(a)), Value::Int(b)) => a
            .checked_mul(*b)
            .map(Value::Int)
            .unwrap_or(Value::Float(a as f64 * *b as f64)),
        (Some(current), other) => {
            Value::Float(current.as_f64().unwrap_or(0.0) * other.as_f64().unwrap_or(0.0))
        }
    };
    Ok(set(doc, path, &next))
}

/// `$min` / `$max`: replace when the operand orders `wanted` against the
/// current value. Equal values leave the document untouched.
fn bound(doc: &mut Value, path: &str, operand: &Value, wanted: std::cmp::Ordering) -> bool {
    match resolve(doc, path) {
        Some(current) if operand.compare(&current) != wanted => false,
        _ => set(doc, path, operand),
    }
}

fn rename(doc: &mut Value, path: &str, target: &Value, modified: &mut Vec<String>) -> Result<bool> {
    let target = target.as_str().ok_or_else(|| {
        Error::InvalidQuery(format!("$rename target for '{path}' must be a string"))
    })?;
    if target == path {
        return Err(Error::InvalidQuery(format!(
            "$rename source and target are the same: '{path}'"
        )));
    }
    let Some(value) = resolve(doc, path) else {
        return Ok(false);
    };
    remove_value(doc, path);
    set_value(doc, target, value);
    if !modified.iter().any(|m| m == target) {
        modified.push(target.to_string());
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Array operators
// ---------------------------------------------------------------------------

/// Existing array at `path`; missing counts as empty.
fn array_at(op: &str, doc: &Value, path: &str) -> Result<Option<Vec<Value>>> {
    match resolve(doc, path) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(Error::evaluation(
            op,
            format!("field '{path}' is not an array"),
        )),
    }
}

/// Values carried by an operand, unpacking `{$each: [...]}`.
fn each(op: &str, operand: &Value) -> Result<Vec<Value>> {
    match operand.as_object() {
        Some(map) if map.contains_key("$each") => match map.get("$each") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(Error::InvalidQuery(format!("{op}: $each requires an array"))),
        },
        _ => Ok(vec![operand.clone()]),
    }
}

fn push(doc: &mut Value, path: &str, operand: &Value) -> Result<bool> {
    let mut items = array_at("$push", doc, path)?.unwrap_or_default();
    let values = each("$push", operand)?;
    let position = match operand.get("$position").map(Value::as_i64) {
        None => items.len(),
        Some(Some(p)) if p < 0 => items.len().saturating_sub(p.unsigned_abs() as usize),
        Some(Some(p)) => (p as usize).min(items.len()),
        Some(None) => {
            return Err(Error::InvalidQuery("$push: $position must be an integer".into()))
        }
    };
    items.splice(position..position, values);
    if let Some(slice) = operand.get("$slice") {
        let n = slice
            .as_i64()
            .ok_or_else(|| Error::InvalidQuery("$push: $slice must be an integer".into()))?;
        if n >= 0 {
            items.truncate(n as usize);
        } else {
            let keep = n.unsigned_abs() as usize;
            let drop = items.len().saturating_sub(keep);
            items.drain(..drop);
        }
    }
    Ok(set(doc, path, &Value::Array(items)))
}

fn add_to_set(doc: &mut Value, path: &str, operand: &Value) -> Result<bool> {
    let existing = array_at("$addToSet", doc, path)?;
    let created = existing.is_none();
    let mut items = existing.unwrap_or_default();
    let mut grew = false;
    for value in each("$addToSet", operand)? {
        if !items.contains(&value) {
            items.push(value);
            grew = true;
        }
    }
    if grew || created {
        set_value(doc, path, Value::Array(items));
    }
    Ok(grew || created)
}

/// Element test for `$pull`: a query for document elements, an operator
/// condition for scalars, equality otherwise.
enum PullCondition {
    Query(Query),
    Operators(Query),
    Equals(Value),
}

impl PullCondition {
    fn compile(operand: &Value, options: &Options) -> Result<Self> {
        match operand.as_object() {
            Some(map) if map.keys().any(|k| k.starts_with('$')) => {
                let mut wrapped = Document::with_capacity(1);
                wrapped.insert("v".to_string(), operand.clone());
                Ok(PullCondition::Operators(Query::new(&Value::Object(wrapped), options)?))
            }
            Some(_) => Ok(PullCondition::Query(Query::new(operand, options)?)),
            None => Ok(PullCondition::Equals(operand.clone())),
        }
    }

    fn matches(&self, item: &Value) -> Result<bool> {
        match self {
            PullCondition::Query(q) if item.is_object() => q.test(item),
            PullCondition::Query(_) => Ok(false),
            PullCondition::Operators(q) => {
                let mut wrapped = Document::with_capacity(1);
                wrapped.insert("v".to_string(), item.clone());
                q.test(&Value::Object(wrapped))
            }
            PullCondition::Equals(v) => Ok(item == v),
        }
    }
}

fn pull(doc: &mut Value, path: &str, operand: &Value, options: &Options) -> Result<bool> {
    let Some(items) = array_at("$pull", doc, path)? else {
        return Ok(false);
    };
    let condition = PullCondition::compile(operand, options)?;
    let before = items.len();
    let mut kept = Vec::with_capacity(before);
    for item in items {
        if !condition.matches(&item)? {
            kept.push(item);
        }
    }
    if kept.len() == before {
        return Ok(false);
    }
    set_value(doc, path, Value::Array(kept));
    Ok(true)
}

fn pop(doc: &mut Value, path: &str, operand: &Value) -> Result<bool> {
    let Some(mut items) = array_at("$pop", doc, path)? else {
        return Ok(false);
    };
    let from_front = match operand.as_i64() {
        Some(1) => false,
        Some(-1) => true,
        _ => {
            return Err(Error::InvalidQuery(format!(
                "$pop value for '{path}' must be 1 or -1"
            )))
        }
    };
    if items.is_empty() {
        return Ok(false);
    }
    if from_front {
        items.remove(0);
    } else {
        items.pop();
    }
    set_value(doc, path, Value::Array(items));
    Ok(true)
}

// ===========================================================================
// Tests
// ===========================================================================
