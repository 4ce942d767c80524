//! Accumulator operators for `$group` and windowed outputs.

use std::sync::Arc;

use indexmap::IndexSet;

use crate::context::Operator;
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::operators::expression::{add_numbers, average};
use crate::sort::{parse_sort_spec, sort_documents};
use crate::value::Value;

type AccFn = fn(&[Value], &Expression, &Env<'_>) -> Result<Value>;

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    let table: &[(&'static str, AccFn)] = &[
        ("$sum", sum),
        ("$avg", avg),
        ("$min", min),
        ("$max", max),
        ("$first", first),
        ("$last", last),
        ("$push", push),
        ("$addToSet", add_to_set),
        ("$count", count),
        ("$firstN", first_n),
        ("$lastN", last_n),
        ("$top", top),
        ("$bottom", bottom),
        ("$topN", top_n),
        ("$bottomN", bottom_n),
    ];
    table
        .iter()
        .map(|(name, f)| (*name, Operator::Accumulator(Arc::new(*f))))
        .collect()
}

/// Evaluate `expr` against every member of the collection.
fn collect(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| expr.evaluate(item, &env.with_root(item)))
        .collect()
}

fn sum(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(add_numbers(&collect(items, expr, env)?))
}

fn avg(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    Ok(average(&collect(items, expr, env)?))
}

fn min(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = collect(items, expr, env)?;
    Ok(values.into_iter().filter(|v| !v.is_nil()).min().unwrap_or(Value::Null))
}

fn max(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = collect(items, expr, env)?;
    Ok(values.into_iter().filter(|v| !v.is_nil()).max().unwrap_or(Value::Null))
}

fn first(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    match items.first() {
        Some(item) => expr.evaluate(item, &env.with_root(item)),
        None => Ok(Value::Missing),
    }
}

fn last(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    match items.last() {
        Some(item) => expr.evaluate(item, &env.with_root(item)),
        None => Ok(Value::Missing),
    }
}

fn push(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    let values = collect(items, expr, env)?;
    Ok(Value::Array(values.into_iter().filter(|v| !v.is_missing()).collect()))
}

/// Distinct values in first-seen order.
fn add_to_set(items: &[Value], expr: &Expression, env: &Env<'_>) -> Result<Value> {
    let set: IndexSet<Value> = collect(items, expr, env)?
        .into_iter()
        .filter(|v| !v.is_missing())
        .collect();
    Ok(Value::Array(set.into_iter().collect()))
}

fn count(items: &[Value], _expr: &Expression, _env: &Env<'_>) -> Result<Value> {
    Ok(Value::from(items.len()))
}

// ---------------------------------------------------------------------------
// N-ary and sorted accumulators
// ---------------------------------------------------------------------------

/// `n` of the `...N` accumulators; evaluated against the group key so it
/// may depend on it.
fn limit_n(op: &str, args: &Expression, env: &Env<'_>) -> Result<usize> {
    let expr = args
        .arg("n")
        .ok_or_else(|| Error::evaluation(op, "missing 'n'"))?;
    let doc = env.group_id.unwrap_or(env.root);
    match expr.evaluate(doc, env)? {
        Value::Int(n) if n > 0 => Ok(n as usize),
        Value::Float(f) if f > 0.0 && f.fract() == 0.0 => Ok(f as usize),
        other => Err(Error::evaluation(
            op,
            format!("'n' must be a positive integer, found {other}"),
        )),
    }
}

fn input_arg<'e>(op: &str, args: &'e Expression, name: &str) -> Result<&'e Expression> {
    args.arg(name)
        .ok_or_else(|| Error::evaluation(op, format!("missing '{name}'")))
}

fn first_n(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let n = limit_n("$firstN", args, env)?;
    let input = input_arg("$firstN", args, "input")?;
    let head = &items[..n.min(items.len())];
    collect(head, input, env).map(|vs| Value::Array(vs.into_iter().map(Value::or_null).collect()))
}

fn last_n(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let n = limit_n("$lastN", args, env)?;
    let input = input_arg("$lastN", args, "input")?;
    let tail = &items[items.len().saturating_sub(n)..];
    collect(tail, input, env).map(|vs| Value::Array(vs.into_iter().map(Value::or_null).collect()))
}

/// Copy of the collection ordered by the operator's `sortBy`.
fn sorted(op: &str, items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Vec<Value>> {
    let sort_by = input_arg(op, args, "sortBy")?.evaluate(env.root, env)?;
    let spec = parse_sort_spec(&sort_by)
        .map_err(|e| Error::evaluation(op, format!("invalid 'sortBy': {e}")))?;
    let mut docs = items.to_vec();
    sort_documents(&mut docs, &spec, env.options);
    Ok(docs)
}

fn output_of(op: &str, docs: &[Value], args: &Expression, env: &Env<'_>) -> Result<Vec<Value>> {
    let output = input_arg(op, args, "output")?;
    collect(docs, output, env).map(|vs| vs.into_iter().map(Value::or_null).collect())
}

fn top(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let docs = sorted("$top", items, args, env)?;
    let head = &docs[..docs.len().min(1)];
    Ok(output_of("$top", head, args, env)?.pop().unwrap_or(Value::Null))
}

fn bottom(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let docs = sorted("$bottom", items, args, env)?;
    let tail = &docs[docs.len().saturating_sub(1)..];
    Ok(output_of("$bottom", tail, args, env)?.pop().unwrap_or(Value::Null))
}

fn top_n(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let n = limit_n("$topN", args, env)?;
    let docs = sorted("$topN", items, args, env)?;
    let head = &docs[..n.min(docs.len())];
    output_of("$topN", head, args, env).map(Value::Array)
}

fn bottom_n(items: &[Value], args: &Expression, env: &Env<'_>) -> Result<Value> {
    let n = limit_n("$bottomN", args, env)?;
    let docs = sorted("$bottomN", items, args, env)?;
    let tail = &docs[docs.len().saturating_sub(n)..];
    output_of("$bottomN", tail, args, env).map(Value::Array)
}
