//! Window-only operators for `$setWindowFields`.
//!
//! These read the whole sorted partition through [`WindowInput`] rather than
//! the bounded window; `$setWindowFields` rejects a `window` for all of them
//! except `$documentNumber`, which ignores it.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::context::Operator;
use crate::error::{Error, Result};
use crate::expression::Env;
use crate::sort::{compare_documents, SortSpec};
use crate::value::Value;
use crate::window::WindowInput;

type WindowFn = fn(&Value, &[Value], &WindowInput<'_>, &Env<'_>) -> Result<Value>;

pub(crate) fn operators() -> Vec<(&'static str, Operator)> {
    let table: &[(&'static str, WindowFn)] = &[
        ("$documentNumber", document_number),
        ("$rank", rank),
        ("$denseRank", dense_rank),
        ("$shift", shift),
        ("$expMovingAvg", exp_moving_avg),
        ("$locf", locf),
    ];
    table
        .iter()
        .map(|(name, f)| (*name, Operator::Window(Arc::new(*f))))
        .collect()
}

fn document_number(_: &Value, _: &[Value], input: &WindowInput<'_>, _: &Env<'_>) -> Result<Value> {
    Ok(Value::from(input.document_number))
}

fn sort_spec<'a>(op: &str, input: &WindowInput<'a>) -> Result<&'a SortSpec> {
    input
        .sort_by
        .ok_or_else(|| Error::evaluation(op, "requires a sortBy"))
}

/// Value at the current position of a column computed once per partition.
fn memoized<F>(input: &WindowInput<'_>, column: F) -> Result<Value>
where
    F: FnOnce() -> Result<Vec<Value>>,
{
    if input.memo.get().is_none() {
        let _ = input.memo.set(column()?);
    }
    Ok(input
        .memo
        .get()
        .and_then(|values| values.get(input.document_number - 1))
        .cloned()
        .unwrap_or(Value::Null))
}

/// Rank with gaps: ties share the position of their first member.
fn rank(_: &Value, _: &[Value], input: &WindowInput<'_>, env: &Env<'_>) -> Result<Value> {
    let spec = sort_spec("$rank", input)?;
    memoized(input, || {
        let mut ranks: Vec<Value> = Vec::with_capacity(input.partition.len());
        for (i, doc) in input.partition.iter().enumerate() {
            let rank = match i.checked_sub(1).map(|p| (p, &input.partition[p])) {
                Some((p, prev)) if compare_documents(prev, doc, spec, env.options) == Ordering::Equal => {
                    ranks[p].clone()
                }
                _ => Value::from(i + 1),
            };
            ranks.push(rank);
        }
        Ok(ranks)
    })
}

/// Rank without gaps: one step per distinct sort key.
fn dense_rank(_: &Value, _: &[Value], input: &WindowInput<'_>, env: &Env<'_>) -> Result<Value> {
    let spec = sort_spec("$denseRank", input)?;
    memoized(input, || {
        let mut rank = 0usize;
        let mut prev: Option<&Value> = None;
        let mut ranks = Vec::with_capacity(input.partition.len());
        for doc in input.partition {
            if prev.is_none_or(|p| compare_documents(p, doc, spec, env.options) != Ordering::Equal) {
                rank += 1;
            }
            prev = Some(doc);
            ranks.push(Value::from(rank));
        }
        Ok(ranks)
    })
}

/// `output` evaluated on the document `by` positions away, else `default`.
fn shift(current: &Value, _: &[Value], input: &WindowInput<'_>, env: &Env<'_>) -> Result<Value> {
    let args = input.args;
    let output = args
        .arg("output")
        .ok_or_else(|| Error::evaluation("$shift", "missing 'output'"))?;
    let by = match args.arg("by").map(|e| e.evaluate(current, env)).transpose()? {
        Some(Value::Int(n)) => n,
        _ => return Err(Error::evaluation("$shift", "'by' must be an integer")),
    };
    let target = (input.document_number as i64 - 1)
        .checked_add(by)
        .and_then(|i| usize::try_from(i).ok())
        .and_then(|i| input.partition.get(i));
    match target {
        Some(doc) => Ok(output.evaluate(doc, &env.with_root(doc))?.or_null()),
        None => match args.arg("default") {
            Some(default) => Ok(default.evaluate(current, env)?.or_null()),
            None => Ok(Value::Null),
        },
    }
}

/// Exponential moving average over the partition up to the current
/// document. Weight is `2 / (N + 1)` or `alpha`; any non-numeric input in
/// the partition yields null.
fn exp_moving_avg(_: &Value, _: &[Value], input: &WindowInput<'_>, env: &Env<'_>) -> Result<Value> {
    let args = input.args;
    let expr = args
        .arg("input")
        .ok_or_else(|| Error::evaluation("$expMovingAvg", "missing 'input'"))?;
    let literal = |name: &str| -> Result<Option<f64>> {
        match args.arg(name) {
            None => Ok(None),
            Some(e) => e
                .as_literal()
                .and_then(Value::as_f64)
                .map(Some)
                .ok_or_else(|| Error::evaluation("$expMovingAvg", format!("'{name}' must be a number"))),
        }
    };
    let weight = match (literal("N")?, literal("alpha")?) {
        (Some(n), None) if n >= 1.0 && n.fract() == 0.0 => 2.0 / (n + 1.0),
        (None, Some(alpha)) if alpha > 0.0 && alpha < 1.0 => alpha,
        (Some(_), Some(_)) => {
            return Err(Error::evaluation(
                "$expMovingAvg",
                "specify either N or alpha, not both",
            ))
        }
        _ => {
            return Err(Error::evaluation(
                "$expMovingAvg",
                "requires a positive integer N or an alpha in (0, 1)",
            ))
        }
    };

    memoized(input, || {
        let mut series = Vec::with_capacity(input.partition.len());
        for doc in input.partition {
            match expr.evaluate(doc, &env.with_root(doc))?.as_f64() {
                Some(x) => series.push(x),
                None => return Ok(vec![Value::Null; input.partition.len()]),
            }
        }
        let mut ema: Option<f64> = None;
        Ok(series
            .into_iter()
            .map(|x| {
                let next = ema.map_or(x, |prev| x * weight + prev * (1.0 - weight));
                ema = Some(next);
                Value::Float(next)
            })
            .collect())
    })
}

/// Last observation carried forward: the nearest non-null value at or
/// before the current document.
fn locf(_: &Value, _: &[Value], input: &WindowInput<'_>, env: &Env<'_>) -> Result<Value> {
    memoized(input, || {
        let mut carried = Value::Null;
        let mut column = Vec::with_capacity(input.partition.len());
        for doc in input.partition {
            let value = input.args.evaluate(doc, &env.with_root(doc))?;
            if !value.is_nil() {
                carried = value;
            }
            column.push(carried.clone());
        }
        Ok(column)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::context::{Context, Options};
    use crate::error::Result;
    use crate::expression::{Env, Expression};
    use crate::path::resolve;
    use crate::value::Value;
    use crate::window::WindowFieldsSpec;
    use serde_json::json;

    fn run(spec: serde_json::Value, input: serde_json::Value) -> Vec<Value> {
        let opts = Options::default();
        let spec = WindowFieldsSpec::parse(&Value::from(spec), &opts).unwrap();
        let Value::Array(docs) = Value::from(input) else {
            panic!("fixture must be an array");
        };
        spec.run(docs, &opts).unwrap()
    }

    fn column(docs: &[Value], name: &str) -> Value {
        Value::Array(docs.iter().map(|d| resolve(d, name).unwrap_or(Value::Null)).collect())
    }

    #[test]
    fn ranks_with_and_without_gaps() {
        let out = run(
            json!({
                "sortBy": {"score": -1},
                "output": {
                    "rank": {"$rank": {}},
                    "dense": {"$denseRank": {}},
                    "n": {"$documentNumber": {}}
                }
            }),
            json!([{"score": 10}, {"score": 30}, {"score": 20}, {"score": 30}, {"score": 5}]),
        );
        assert_eq!(column(&out, "score"), Value::from(json!([30, 30, 20, 10, 5])));
        assert_eq!(column(&out, "rank"), Value::from(json!([1, 1, 3, 4, 5])));
        assert_eq!(column(&out, "dense"), Value::from(json!([1, 1, 2, 3, 4])));
        assert_eq!(column(&out, "n"), Value::from(json!([1, 2, 3, 4, 5])));
    }

    #[test]
    fn shift_looks_forward_and_back() {
        let out = run(
            json!({
                "sortBy": {"t": 1},
                "output": {
                    "next": {"$shift": {"output": "$v", "by": 1, "default": "none"}},
                    "prev": {"$shift": {"output": "$v", "by": -1}}
                }
            }),
            json!([{"t": 1, "v": "a"}, {"t": 2, "v": "b"}, {"t": 3, "v": "c"}]),
        );
        assert_eq!(column(&out, "next"), Value::from(json!(["b", "c", "none"])));
        assert_eq!(column(&out, "prev"), Value::from(json!([null, "a", "b"])));
    }

    #[test]
    fn exp_moving_average() {
        let out = run(
            json!({"sortBy": {"t": 1}, "output": {"ema": {"$expMovingAvg": {"input": "$p", "alpha": 0.5}}}}),
            json!([{"t": 1, "p": 10}, {"t": 2, "p": 20}, {"t": 3, "p": 40}]),
        );
        assert_eq!(column(&out, "ema"), Value::from(json!([10.0, 15.0, 27.5])));

        let out = run(
            json!({"sortBy": {"t": 1}, "output": {"ema": {"$expMovingAvg": {"input": "$p", "N": 3}}}}),
            json!([{"t": 1, "p": 10}, {"t": 2, "p": 20}]),
        );
        assert_eq!(column(&out, "ema"), Value::from(json!([10.0, 15.0])));
    }

    #[test]
    fn exp_moving_average_with_non_numbers_is_null() {
        let out = run(
            json!({"sortBy": {"t": 1}, "output": {"ema": {"$expMovingAvg": {"input": "$p", "N": 2}}}}),
            json!([{"t": 1, "p": 10}, {"t": 2, "p": "x"}]),
        );
        assert_eq!(column(&out, "ema"), Value::from(json!([null, null])));
    }

    #[test]
    fn exp_moving_average_rejects_both_weights() {
        let opts = Options::default();
        let spec = WindowFieldsSpec::parse(
            &Value::from(json!({"sortBy": {"t": 1}, "output": {"e": {"$expMovingAvg": {"input": "$p", "N": 2, "alpha": 0.5}}}})),
            &opts,
        )
        .unwrap();
        assert!(spec.run(vec![Value::from(json!({"t": 1, "p": 1}))], &opts).is_err());
    }

    #[test]
    fn locf_fills_gaps_per_partition() {
        let out = run(
            json!({
                "partitionBy": "$s",
                "sortBy": {"t": 1},
                "output": {"price": {"$locf": "$price"}}
            }),
            json!([
                {"s": "a", "t": 1, "price": 5},
                {"s": "a", "t": 2},
                {"s": "b", "t": 1},
                {"s": "a", "t": 3, "price": null},
                {"s": "b", "t": 2, "price": 7}
            ]),
        );
        assert_eq!(column(&out, "s"), Value::from(json!(["a", "a", "a", "b", "b"])));
        assert_eq!(column(&out, "price"), Value::from(json!([5, 5, 5, null, 7])));
    }

    #[test]
    fn partition_wide_operators_evaluate_each_document_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut ctx = Context::with_defaults();
        ctx.add_expression_operator(
            "$counted",
            Arc::new(move |doc: &Value, args: &Expression, env: &Env<'_>| -> Result<Value> {
                counter.fetch_add(1, Ordering::SeqCst);
                args.evaluate(doc, env)
            }),
        );
        let opts = Options::default().with_context(ctx);
        let spec = WindowFieldsSpec::parse(
            &Value::from(json!({
                "sortBy": {"t": 1},
                "output": {
                    "ema": {"$expMovingAvg": {"input": {"$counted": "$p"}, "alpha": 0.5}},
                    "filled": {"$locf": {"$counted": "$p"}}
                }
            })),
            &opts,
        )
        .unwrap();
        let docs: Vec<Value> = (0..50).map(|t| Value::from(json!({"t": t, "p": t}))).collect();
        let out = spec.run(docs, &opts).unwrap();

        assert_eq!(out.len(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(out[1].get("ema"), Some(&Value::Float(0.5)));
        assert_eq!(out[49].get("filled"), Some(&Value::Int(49)));
    }

    #[test]
    fn ranks_restart_in_each_partition() {
        let out = run(
            json!({
                "partitionBy": "$g",
                "sortBy": {"s": 1},
                "output": {"rank": {"$rank": {}}, "dense": {"$denseRank": {}}}
            }),
            json!([
                {"g": "a", "s": 1}, {"g": "b", "s": 9}, {"g": "a", "s": 1},
                {"g": "a", "s": 4}, {"g": "b", "s": 9}, {"g": "b", "s": 10}
            ]),
        );
        assert_eq!(column(&out, "rank"), Value::from(json!([1, 1, 3, 1, 1, 3])));
        assert_eq!(column(&out, "dense"), Value::from(json!([1, 1, 2, 1, 1, 2])));
    }
}
