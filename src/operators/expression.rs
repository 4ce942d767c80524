//! Expression operators.
//!
//! Every operator receives its arguments unevaluated and decides what to
//! evaluate, which lets `$cond` and `$switch` skip untaken branches and lets
//! `$filter`, `$map`, `$reduce` and `$let` bind variables first.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono::NaiveDateTime;

use crate::context::Operator;
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::operators::date_add;
use crate::value::{number_to_value, parse_date, Document, Value};

type ExprFn = fn(&Value, &Expression, &Env<'_>) -> Result<Value>;

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    let table: &[(&'static str, ExprFn)] = &[
        // arithmetic
        ("$add", add),
        ("$subtract", subtract),
        ("$multiply", multiply),
        ("$divide", divide),
        ("$mod", modulo),
        ("$abs", abs),
        ("$ceil", ceil),
        ("$floor", floor),
        ("$round", round),
        // comparison ($eq and friends come from the predicates)
        ("$cmp", cmp),
        // boolean
        ("$and", and),
        ("$or", or),
        ("$not", not),
        // conditional
        ("$cond", cond),
        ("$ifNull", if_null),
        ("$switch", switch),
        // array
        ("$size", size),
        ("$arrayElemAt", array_elem_at),
        ("$concatArrays", concat_arrays),
        ("$filter", filter),
        ("$map", map),
        ("$reduce", reduce),
        ("$range", range),
        ("$slice", slice),
        ("$first", first),
        ("$last", last),
        ("$in", in_array),
        ("$isArray", is_array),
        ("$reverseArray", reverse_array),
        // variable
        ("$let", let_),
        // object
        ("$objectToArray", object_to_array),
        ("$arrayToObject", array_to_object),
        ("$mergeObjects", merge_objects),
        // string
        ("$concat", concat),
        ("$toUpper", to_upper),
        ("$toLower", to_lower),
        ("$strcasecmp", strcasecmp),
        ("$substrCP", substr_cp),
        // date
        ("$dateAdd", date_add_op),
        ("$dateFromString", date_from_string),
        // type
        ("$type", type_),
        // set
        ("$anyElementTrue", any_element_true),
        ("$allElementsTrue", all_elements_true),
        // accumulators in expression form
        ("$sum", sum),
        ("$avg", avg),
        ("$min", min),
        ("$max", max),
    ];
    table
        .iter()
        .map(|(name, f)| (*name, Operator::Expression(Arc::new(*f))))
        .collect()
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Exactly `n` positional arguments.
fn positional(op: &str, args: &Expression, doc: &Value, env: &Env<'_>, n: usize) -> Result<Vec<Value>> {
    let values = args.evaluate_args(doc, env)?;
    if values.len() != n {
        return Err(Error::evaluation(
            op,
            format!("expects {n} argument(s), got {}", values.len()),
        ));
    }
    Ok(values)
}

/// A single argument given either bare or wrapped in a one-element array.
fn single(args: &Expression, doc: &Value, env: &Env<'_>) -> Result<Value> {
    match args.items() {
        Some([only]) => only.evaluate(doc, env),
        _ => args.evaluate(doc, env),
    }
}

/// Named argument of an object-form operator, evaluated; missing when absent.
fn named(args: &Expression, name: &str, doc: &Value, env: &Env<'_>) -> Result<Value> {
    match args.arg(name) {
        Some(expr) => expr.evaluate(doc, env),
        None => Ok(Value::Missing),
    }
}

fn require_object_args(op: &str, args: &Expression) -> Result<()> {
    match args {
        Expression::Object(_) => Ok(()),
        _ => Err(Error::evaluation(op, "expects an object argument")),
    }
}

fn number_arg(op: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::evaluation(op, format!("expects a number, found {}", value.type_name())))
}

fn integer_arg(op: &str, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::evaluation(op, format!("expects an integer, found {value}")))
}

fn variable_name(op: &str, args: &Expression, doc: &Value, env: &Env<'_>) -> Result<String> {
    match named(args, "as", doc, env)? {
        Value::Missing => Ok("this".to_string()),
        Value::String(s) => Ok(s),
        other => Err(Error::evaluation(op, format!("'as' must be a string, found {other}"))),
    }
}

/// Array input of `$filter`/`$map`/`$reduce`; `None` for null or missing.
fn array_input(op: &str, args: &Expression, doc: &Value, env: &Env<'_>) -> Result<Option<Vec<Value>>> {
    match named(args, "input", doc, env)? {
        v if v.is_nil() => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(Error::evaluation(
            op,
            format!("'input' must resolve to an array, found {}", other.type_name()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// Sum of numbers, staying integral while every term is an integer.
pub(crate) fn add_numbers(values: &[Value]) -> Value {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0;
    for v in values {
        match v {
            Value::Int(i) => {
                int_sum = int_sum.and_then(|s| s.checked_add(*i));
                float_sum += *i as f64;
            }
            Value::Float(f) => {
                int_sum = None;
                float_sum += f;
            }
            _ => {}
        }
    }
    match int_sum {
        Some(s) => Value::Int(s),
        None => Value::Float(float_sum),
    }
}

fn add(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    if values.iter().any(Value::is_nil) {
        return Ok(Value::Null);
    }
    let mut date: Option<i64> = None;
    let mut numbers = Vec::with_capacity(values.len());
    for v in values {
        match v {
            Value::Date(ms) if date.is_none() => date = Some(ms),
            Value::Date(_) => return Err(Error::evaluation("$add", "only one date allowed")),
            n if n.is_number() => numbers.push(n),
            other => {
                return Err(Error::evaluation(
                    "$add",
                    format!("only numbers and dates are supported, found {}", other.type_name()),
                ))
            }
        }
    }
    let total = add_numbers(&numbers);
    match date {
        Some(ms) => ms
            .checked_add(total.as_f64().unwrap_or(0.0) as i64)
            .map(Value::Date)
            .ok_or_else(|| Error::evaluation("$add", "date overflow")),
        None => Ok(total),
    }
}

fn subtract(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$subtract", args, doc, env, 2)?;
    match (&values[0], &values[1]) {
        (a, b) if a.is_nil() || b.is_nil() => Ok(Value::Null),
        (Value::Int(a), Value::Int(b)) => Ok(a
            .checked_sub(*b)
            .map(Value::Int)
            .unwrap_or(Value::Float(*a as f64 - *b as f64))),
        (Value::Date(a), Value::Date(b)) => a
            .checked_sub(*b)
            .map(Value::Int)
            .ok_or_else(|| Error::evaluation("$subtract", "date overflow")),
        (Value::Date(a), n) if n.is_number() => a
            .checked_sub(n.as_f64().unwrap_or(0.0) as i64)
            .map(Value::Date)
            .ok_or_else(|| Error::evaluation("$subtract", "date overflow")),
        (a, b) if a.is_number() && b.is_number() => Ok(Value::Float(
            a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0),
        )),
        (a, b) => Err(Error::evaluation(
            "$subtract",
            format!("cannot subtract {} from {}", b.type_name(), a.type_name()),
        )),
    }
}

fn multiply(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    if values.iter().any(Value::is_nil) {
        return Ok(Value::Null);
    }
    let mut int_product: Option<i64> = Some(1);
    let mut product = 1.0;
    for v in &values {
        match v {
            Value::Int(i) => {
                int_product = int_product.and_then(|p| p.checked_mul(*i));
                product *= *i as f64;
            }
            Value::Float(f) => {
                int_product = None;
                product *= f;
            }
            other => {
                return Err(Error::evaluation(
                    "$multiply",
                    format!("only numbers are supported, found {}", other.type_name()),
                ))
            }
        }
    }
    Ok(int_product.map(Value::Int).unwrap_or(Value::Float(product)))
}

fn divide(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$divide", args, doc, env, 2)?;
    if values.iter().any(Value::is_nil) {
        return Ok(Value::Null);
    }
    let a = number_arg("$divide", &values[0])?;
    let b = number_arg("$divide", &values[1])?;
    if b == 0.0 {
        return Err(Error::evaluation("$divide", "cannot divide by zero"));
    }
    Ok(number_to_value(a / b))
}

fn modulo(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$mod", args, doc, env, 2)?;
    match (&values[0], &values[1]) {
        (a, b) if a.is_nil() || b.is_nil() => Ok(Value::Null),
        (_, b) if b.as_f64() == Some(0.0) => Err(Error::evaluation("$mod", "cannot divide by zero")),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
        (a, b) => Ok(Value::Float(number_arg("$mod", a)? % number_arg("$mod", b)?)),
    }
}

fn unary_number(op: &str, doc: &Value, args: &Expression, env: &Env<'_>, f: fn(f64) -> f64) -> Result<Value> {
    match single(args, doc, env)? {
        v if v.is_nil() => Ok(Value::Null),
        Value::Int(i) if op == "$abs" => Ok(i
            .checked_abs()
            .map(Value::Int)
            .unwrap_or(Value::Float((i as f64).abs()))),
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(x) => Ok(Value::Float(f(x))),
        other => Err(Error::evaluation(
            op,
            format!("expects a number, found {}", other.type_name()),
        )),
    }
}

fn abs(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    unary_number("$abs", doc, args, env, f64::abs)
}

fn ceil(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    unary_number("$ceil", doc, args, env, f64::ceil)
}

fn floor(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    unary_number("$floor", doc, args, env, f64::floor)
}

/// Round half to even at `place` decimal digits (negative places round
/// to tens, hundreds, ...).
fn round(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    let (num, place) = match values.as_slice() {
        [num] => (num.clone(), 0),
        [num, place] => (num.clone(), integer_arg("$round", place)?),
        _ => return Err(Error::evaluation("$round", "expects 1 or 2 arguments")),
    };
    if !(-20..=100).contains(&place) {
        return Err(Error::evaluation("$round", "place must be in [-20, 100]"));
    }
    match num {
        v if v.is_nil() => Ok(Value::Null),
        Value::Int(i) if place >= 0 => Ok(Value::Int(i)),
        Value::Float(f) if !f.is_finite() => Ok(Value::Float(f)),
        v if v.is_number() => {
            let x = v.as_f64().unwrap_or(0.0);
            let rounded = if place >= 0 {
                let scale = 10f64.powi(place as i32);
                (x * scale).round_ties_even() / scale
            } else {
                let scale = 10f64.powi(-place as i32);
                (x / scale).round_ties_even() * scale
            };
            Ok(match v {
                Value::Int(_) => number_to_value(rounded),
                _ => Value::Float(rounded),
            })
        }
        other => Err(Error::evaluation(
            "$round",
            format!("expects a number, found {}", other.type_name()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Comparison & boolean
// ---------------------------------------------------------------------------

fn cmp(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$cmp", args, doc, env, 2)?;
    Ok(Value::Int(match values[0].compare(&values[1]) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

fn and(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let items = match args.items() {
        Some(items) => items,
        None => std::slice::from_ref(args),
    };
    for item in items {
        if !item.evaluate(doc, env)?.is_truthy(env.strict()) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn or(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let items = match args.items() {
        Some(items) => items,
        None => std::slice::from_ref(args),
    };
    for item in items {
        if item.evaluate(doc, env)?.is_truthy(env.strict()) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn not(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(Value::Bool(!single(args, doc, env)?.is_truthy(env.strict())))
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

fn cond(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let (test, then, otherwise) = match args {
        Expression::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Expression::Object(_) => match (args.arg("if"), args.arg("then"), args.arg("else")) {
            (Some(i), Some(t), Some(e)) => (i, t, e),
            _ => return Err(Error::evaluation("$cond", "needs 'if', 'then' and 'else'")),
        },
        _ => return Err(Error::evaluation("$cond", "expects [if, then, else] or an object")),
    };
    if test.evaluate(doc, env)?.is_truthy(env.strict()) {
        then.evaluate(doc, env)
    } else {
        otherwise.evaluate(doc, env)
    }
}

/// First non-null argument; the last argument is the fallback.
fn if_null(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let items = match args.items() {
        Some(items) if items.len() >= 2 => items,
        _ => return Err(Error::evaluation("$ifNull", "expects at least 2 arguments")),
    };
    let (fallback, candidates) = match items.split_last() {
        Some(parts) => parts,
        None => return Ok(Value::Null),
    };
    for candidate in candidates {
        let value = candidate.evaluate(doc, env)?;
        if !value.is_nil() {
            return Ok(value);
        }
    }
    fallback.evaluate(doc, env)
}

fn switch(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$switch", args)?;
    let branches = args
        .arg("branches")
        .and_then(Expression::items)
        .ok_or_else(|| Error::evaluation("$switch", "'branches' must be an array"))?;
    for branch in branches {
        let (case, then) = match (branch.arg("case"), branch.arg("then")) {
            (Some(c), Some(t)) => (c, t),
            _ => return Err(Error::evaluation("$switch", "each branch needs 'case' and 'then'")),
        };
        if case.evaluate(doc, env)?.is_truthy(env.strict()) {
            return then.evaluate(doc, env);
        }
    }
    match args.arg("default") {
        Some(default) => default.evaluate(doc, env),
        None => Err(Error::evaluation(
            "$switch",
            "no branch matched and no default was given",
        )),
    }
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

fn size(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    match single(args, doc, env)? {
        Value::Array(items) => Ok(Value::from(items.len())),
        other => Err(Error::evaluation(
            "$size",
            format!("argument must be an array, found {}", other.type_name()),
        )),
    }
}

fn array_elem_at(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$arrayElemAt", args, doc, env, 2)?;
    if values[0].is_nil() {
        return Ok(Value::Null);
    }
    let items = values[0]
        .as_array()
        .ok_or_else(|| Error::evaluation("$arrayElemAt", "first argument must be an array"))?;
    let index = integer_arg("$arrayElemAt", &values[1])?;
    let resolved = if index < 0 {
        items.len().checked_sub(index.unsigned_abs() as usize)
    } else {
        Some(index as usize)
    };
    Ok(resolved
        .and_then(|i| items.get(i))
        .cloned()
        .unwrap_or(Value::Missing))
}

fn concat_arrays(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    let mut out = Vec::new();
    for v in values {
        match v {
            v if v.is_nil() => return Ok(Value::Null),
            Value::Array(items) => out.extend(items),
            other => {
                return Err(Error::evaluation(
                    "$concatArrays",
                    format!("only arrays are supported, found {}", other.type_name()),
                ))
            }
        }
    }
    Ok(Value::Array(out))
}

fn filter(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$filter", args)?;
    let Some(input) = array_input("$filter", args, doc, env)? else {
        return Ok(Value::Null);
    };
    let name = variable_name("$filter", args, doc, env)?;
    let condition = args
        .arg("cond")
        .ok_or_else(|| Error::evaluation("$filter", "missing 'cond'"))?;
    let limit = match named(args, "limit", doc, env)? {
        v if v.is_nil() => usize::MAX,
        v => usize::try_from(integer_arg("$filter", &v)?)
            .map_err(|_| Error::evaluation("$filter", "'limit' must be positive"))?,
    };

    let mut out = Vec::new();
    for item in input {
        if out.len() >= limit {
            break;
        }
        let keep = env.with_vars(vec![(name.clone(), item.clone())], |scoped| {
            condition.evaluate(doc, scoped)
        })?;
        if keep.is_truthy(env.strict()) {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn map(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$map", args)?;
    let Some(input) = array_input("$map", args, doc, env)? else {
        return Ok(Value::Null);
    };
    let name = variable_name("$map", args, doc, env)?;
    let body = args
        .arg("in")
        .ok_or_else(|| Error::evaluation("$map", "missing 'in'"))?;
    input
        .into_iter()
        .map(|item| {
            env.with_vars(vec![(name.clone(), item)], |scoped| body.evaluate(doc, scoped))
                .map(Value::or_null)
        })
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

/// Fold `in` over the input with `$$value` (accumulator) and `$$this`.
fn reduce(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$reduce", args)?;
    let Some(input) = array_input("$reduce", args, doc, env)? else {
        return Ok(Value::Null);
    };
    let body = args
        .arg("in")
        .ok_or_else(|| Error::evaluation("$reduce", "missing 'in'"))?;
    let mut acc = named(args, "initialValue", doc, env)?.or_null();
    for item in input {
        acc = env.with_vars(
            vec![("value".to_string(), acc), ("this".to_string(), item)],
            |scoped| body.evaluate(doc, scoped),
        )?;
    }
    Ok(acc)
}

fn range(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    let (start, end, step) = match values.as_slice() {
        [s, e] => (integer_arg("$range", s)?, integer_arg("$range", e)?, 1),
        [s, e, st] => (
            integer_arg("$range", s)?,
            integer_arg("$range", e)?,
            integer_arg("$range", st)?,
        ),
        _ => return Err(Error::evaluation("$range", "expects 2 or 3 arguments")),
    };
    if step == 0 {
        return Err(Error::evaluation("$range", "step must not be zero"));
    }
    let mut out = Vec::new();
    let mut n = start;
    while (step > 0 && n < end) || (step < 0 && n > end) {
        out.push(Value::Int(n));
        n = match n.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::Array(out))
}

/// `[array, n]` takes from the front (or back when negative);
/// `[array, position, n]` starts at `position`.
fn slice(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = args.evaluate_args(doc, env)?;
    let (array, position, count) = match values.as_slice() {
        [a, _] | [a, _, _] if a.is_nil() => return Ok(Value::Null),
        [a, n] => (a, None, integer_arg("$slice", n)?),
        [a, p, n] => (a, Some(integer_arg("$slice", p)?), integer_arg("$slice", n)?),
        _ => return Err(Error::evaluation("$slice", "expects 2 or 3 arguments")),
    };
    let items = array
        .as_array()
        .ok_or_else(|| Error::evaluation("$slice", "first argument must be an array"))?;
    let len = items.len() as i64;
    let (lo, hi) = match position {
        None if count >= 0 => (0, count.min(len)),
        None => (len.saturating_add(count).max(0), len),
        Some(_) if count < 0 => {
            return Err(Error::evaluation("$slice", "n must be positive when a position is given"))
        }
        Some(p) => {
            let lo = if p < 0 { len.saturating_add(p).max(0) } else { p.min(len) };
            (lo, lo.saturating_add(count).min(len))
        }
    };
    Ok(Value::Array(items[lo as usize..hi as usize].to_vec()))
}

fn first(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    match single(args, doc, env)? {
        v if v.is_nil() => Ok(v),
        Value::Array(items) => Ok(items.into_iter().next().unwrap_or(Value::Missing)),
        other => Err(Error::evaluation(
            "$first",
            format!("argument must be an array, found {}", other.type_name()),
        )),
    }
}

fn last(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    match single(args, doc, env)? {
        v if v.is_nil() => Ok(v),
        Value::Array(mut items) => Ok(items.pop().unwrap_or(Value::Missing)),
        other => Err(Error::evaluation(
            "$last",
            format!("argument must be an array, found {}", other.type_name()),
        )),
    }
}

fn in_array(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$in", args, doc, env, 2)?;
    let items = values[1]
        .as_array()
        .ok_or_else(|| Error::evaluation("$in", "second argument must be an array"))?;
    Ok(Value::Bool(items.contains(&values[0])))
}

fn is_array(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(Value::Bool(single(args, doc, env)?.is_array()))
}

fn reverse_array(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    match single(args, doc, env)? {
        v if v.is_nil() => Ok(Value::Null),
        Value::Array(mut items) => {
            items.reverse();
            Ok(Value::Array(items))
        }
        other => Err(Error::evaluation(
            "$reverseArray",
            format!("argument must be an array, found {}", other.type_name()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Variable
// ---------------------------------------------------------------------------

fn let_(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let (vars, body) = match (args.arg("vars"), args.arg("in")) {
        (Some(Expression::Object(vars)), Some(body)) => (vars, body),
        _ => return Err(Error::evaluation("$let", "needs 'vars' (object) and 'in'")),
    };
    let bound = vars
        .iter()
        .map(|(name, expr)| Ok((name.clone(), expr.evaluate(doc, env)?)))
        .collect::<Result<Vec<_>>>()?;
    env.with_vars(bound, |scoped| body.evaluate(doc, scoped))
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

fn object_to_array(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    match single(args, doc, env)? {
        v if v.is_nil() => Ok(Value::Null),
        Value::Object(map) => Ok(Value::Array(
            map.into_iter()
                .map(|(k, v)| {
                    let mut entry = Document::with_capacity(2);
                    entry.insert("k".to_string(), Value::String(k));
                    entry.insert("v".to_string(), v);
                    Value::Object(entry)
                })
                .collect(),
        )),
        other => Err(Error::evaluation(
            "$objectToArray",
            format!("requires a document input, found {}", other.type_name()),
        )),
    }
}

fn array_to_object(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let input = match single(args, doc, env)? {
        v if v.is_nil() => return Ok(Value::Null),
        Value::Array(items) => items,
        other => {
            return Err(Error::evaluation(
                "$arrayToObject",
                format!("requires an array input, found {}", other.type_name()),
            ))
        }
    };
    let mut out = Document::with_capacity(input.len());
    for entry in input {
        let (key, value) = match entry {
            Value::Array(pair) if pair.len() == 2 => {
                let mut pair = pair.into_iter();
                (pair.next(), pair.next())
            }
            Value::Object(mut map) if map.len() == 2 => (map.shift_remove("k"), map.shift_remove("v")),
            _ => (None, None),
        };
        match (key, value) {
            (Some(Value::String(k)), Some(v)) => {
                out.insert(k, v);
            }
            _ => {
                return Err(Error::evaluation(
                    "$arrayToObject",
                    "entries must be [key, value] pairs or {k, v} documents",
                ))
            }
        }
    }
    Ok(Value::Object(out))
}

fn merge_objects(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = match args {
        Expression::Array(_) => args.evaluate_args(doc, env)?,
        other => match other.evaluate(doc, env)? {
            Value::Array(items) => items,
            value => vec![value],
        },
    };
    let mut out = Document::new();
    for v in values {
        match v {
            v if v.is_nil() => {}
            Value::Object(map) => out.extend(map),
            other => {
                return Err(Error::evaluation(
                    "$mergeObjects",
                    format!("arguments must be documents, found {}", other.type_name()),
                ))
            }
        }
    }
    Ok(Value::Object(out))
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

fn concat(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let mut out = String::new();
    for v in args.evaluate_args(doc, env)? {
        match v {
            v if v.is_nil() => return Ok(Value::Null),
            Value::String(s) => out.push_str(&s),
            other => {
                return Err(Error::evaluation(
                    "$concat",
                    format!("only strings are supported, found {}", other.type_name()),
                ))
            }
        }
    }
    Ok(Value::String(out))
}

/// String form used by the case operators; null and missing become "".
fn string_of(value: Value) -> String {
    match value {
        Value::Missing | Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn to_upper(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(Value::String(string_of(single(args, doc, env)?).to_uppercase()))
}

fn to_lower(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(Value::String(string_of(single(args, doc, env)?).to_lowercase()))
}

fn strcasecmp(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$strcasecmp", args, doc, env, 2)?;
    if values[0] == values[1] || values.iter().all(Value::is_nil) {
        return Ok(Value::Int(0));
    }
    match (&values[0], &values[1]) {
        (Value::String(a), Value::String(b)) => Ok(Value::Int(
            match a.to_uppercase().cmp(&b.to_uppercase()) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            },
        )),
        _ => Err(Error::evaluation("$strcasecmp", "arguments must be strings")),
    }
}

/// Substring by code point: `[string, start, length]`.
fn substr_cp(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = positional("$substrCP", args, doc, env, 3)?;
    let text = string_of(values[0].clone());
    let start = usize::try_from(integer_arg("$substrCP", &values[1])?)
        .map_err(|_| Error::evaluation("$substrCP", "start must be non-negative"))?;
    let count = usize::try_from(integer_arg("$substrCP", &values[2])?)
        .map_err(|_| Error::evaluation("$substrCP", "length must be non-negative"))?;
    Ok(Value::String(text.chars().skip(start).take(count).collect()))
}

// ---------------------------------------------------------------------------
// Date
// ---------------------------------------------------------------------------

fn date_add_op(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$dateAdd", args)?;
    let start = named(args, "startDate", doc, env)?;
    let unit = named(args, "unit", doc, env)?;
    let amount = named(args, "amount", doc, env)?;
    if start.is_nil() || unit.is_nil() || amount.is_nil() {
        return Ok(Value::Null);
    }
    let Value::Date(ms) = start else {
        return Err(Error::evaluation("$dateAdd", "'startDate' must be a date"));
    };
    let unit = unit
        .as_str()
        .ok_or_else(|| Error::evaluation("$dateAdd", "'unit' must be a string"))?;
    let amount = integer_arg("$dateAdd", &amount)?;
    date_add(ms, unit, amount).map(Value::Date)
}

/// Parse with a MongoDB-style format string (`%Y-%m-%dT%H:%M:%S.%LZ`).
fn parse_with_format(text: &str, format: &str) -> Option<i64> {
    let format = format.replace("%L", "%3f");
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, &format) {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(text, &format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn date_from_string(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    require_object_args("$dateFromString", args)?;
    let text = named(args, "dateString", doc, env)?;
    if text.is_nil() {
        return Ok(named(args, "onNull", doc, env)?.or_null());
    }
    let format = named(args, "format", doc, env)?;
    let parsed = match (&text, &format) {
        (Value::String(s), Value::String(f)) => parse_with_format(s, f),
        (Value::String(s), _) => parse_date(s),
        _ => None,
    };
    match parsed {
        Some(ms) => Ok(Value::Date(ms)),
        None => match args.arg("onError") {
            Some(on_error) => on_error.evaluate(doc, env),
            None => Err(Error::evaluation(
                "$dateFromString",
                format!("cannot parse date from {text}"),
            )),
        },
    }
}

// ---------------------------------------------------------------------------
// Type & set
// ---------------------------------------------------------------------------

fn type_(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(Value::from(single(args, doc, env)?.type_name()))
}

fn set_argument(op: &str, doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Vec<Value>> {
    match single(args, doc, env)? {
        Value::Array(items) => Ok(items),
        other => Err(Error::evaluation(
            op,
            format!("argument must be an array, found {}", other.type_name()),
        )),
    }
}

fn any_element_true(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let items = set_argument("$anyElementTrue", doc, args, env)?;
    Ok(Value::Bool(items.iter().any(|v| v.is_truthy(env.strict()))))
}

fn all_elements_true(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let items = set_argument("$allElementsTrue", doc, args, env)?;
    Ok(Value::Bool(items.iter().all(|v| v.is_truthy(env.strict()))))
}

// ---------------------------------------------------------------------------
// Accumulators in expression form
// ---------------------------------------------------------------------------

/// Operands of `$sum`/`$avg`/`$min`/`$max`: the elements of a single array
/// argument, otherwise the arguments themselves.
fn accumulator_operands(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Vec<Value>> {
    match args {
        Expression::Array(items) if items.len() != 1 => args.evaluate_args(doc, env),
        _ => match single(args, doc, env)? {
            Value::Array(items) => Ok(items),
            value => Ok(vec![value]),
        },
    }
}

fn sum(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(add_numbers(&accumulator_operands(doc, args, env)?))
}

fn avg(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let operands = accumulator_operands(doc, args, env)?;
    Ok(average(&operands))
}

/// Mean of the numeric members; null when there are none.
pub(crate) fn average(values: &[Value]) -> Value {
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    if numbers.is_empty() {
        Value::Null
    } else {
        Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
    }
}

fn min(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let operands = accumulator_operands(doc, args, env)?;
    Ok(operands.into_iter().filter(|v| !v.is_nil()).min().unwrap_or(Value::Null))
}

fn max(doc: &Value, args: &Expression, env: &Env<'_>) -> Result<Value> {
    let operands = accumulator_operands(doc, args, env)?;
    Ok(operands.into_iter().filter(|v| !v.is_nil()).max().unwrap_or(Value::Null))
}
