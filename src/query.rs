use std::sync::Arc;

use tracing::trace;

use crate::context::{Matcher, Operator, OperatorCategory, Options, QueryOperator};
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::lazy::Lazy;
use crate::predicates::regex_pattern;
use crate::value::{Document, Value};

// ---------------------------------------------------------------------------
// Compiled query
// ---------------------------------------------------------------------------

/// A query specification compiled into per-clause matchers.
///
/// Clauses are AND-ed and evaluated in declaration order; the first failing
/// clause short-circuits. Compilation validates every operator, so a query
/// that builds never fails on configuration at test time.
pub struct Query {
    criteria: Value,
    clauses: Vec<Matcher>,
}

impl Query {
    pub fn new(criteria: &Value, options: &Options) -> Result<Query> {
        let map = criteria
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("query criteria must be an object".into()))?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, rhs) in map {
            if key == "$comment" {
                continue;
            }
            if key.starts_with('$') {
                let op = query_operator(options, key)?;
                clauses.push(op(key, rhs, options)?);
            } else {
                compile_field(key, rhs, options, &mut clauses)?;
            }
        }
        trace!(clauses = clauses.len(), "compiled query");

        Ok(Query {
            criteria: criteria.clone(),
            clauses,
        })
    }

    pub fn criteria(&self) -> &Value {
        &self.criteria
    }

    pub fn test(&self, doc: &Value) -> Result<bool> {
        for clause in &self.clauses {
            if !clause(doc)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Keep only matching documents. Lazy: nothing is tested until pulled.
    pub fn filter<'a>(&'a self, docs: Lazy<'a>) -> Lazy<'a> {
        docs.filter(move |doc| self.test(doc))
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("criteria", &self.criteria).finish()
    }
}

fn query_operator(options: &Options, name: &str) -> Result<QueryOperator> {
    options
        .context
        .query_operator(name)
        .cloned()
        .ok_or_else(|| Error::unknown_operator(OperatorCategory::Query, name))
}

/// Compile the criteria for one field into `out`.
///
/// A literal (or a document without operator keys) means equality; a
/// document of operator keys compiles each key through the registry.
fn compile_field(
    field: &str,
    rhs: &Value,
    options: &Options,
    out: &mut Vec<Matcher>,
) -> Result<()> {
    let ops = match rhs {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
        _ => {
            let eq = query_operator(options, "$eq")?;
            out.push(eq(field, rhs, options)?);
            return Ok(());
        }
    };
    if !ops.keys().all(|k| k.starts_with('$')) {
        return Err(Error::InvalidQuery(format!(
            "criteria for '{field}' mixes operators and plain fields"
        )));
    }

    for (name, operand) in ops {
        match name.as_str() {
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(Error::InvalidQuery("$options without $regex".into()));
                }
            }
            "$regex" => {
                let pattern = regex_pattern(operand, ops.get("$options"))?;
                let op = query_operator(options, name)?;
                out.push(op(field, &Value::String(pattern), options)?);
            }
            "$not" => out.push(negate_field(field, operand, options)?),
            _ => {
                let op = query_operator(options, name)?;
                out.push(op(field, operand, options)?);
            }
        }
    }
    Ok(())
}

/// Field-level `$not`: negates the sub-criteria for the same field.
fn negate_field(field: &str, operand: &Value, options: &Options) -> Result<Matcher> {
    if !operand.is_object() {
        return Err(Error::InvalidQuery("$not needs an operator document".into()));
    }
    let mut criteria = Document::with_capacity(1);
    criteria.insert(field.to_string(), operand.clone());
    let query = Query::new(&Value::Object(criteria), options)?;
    Ok(Box::new(move |doc: &Value| Ok(!query.test(doc)?)))
}

// ---------------------------------------------------------------------------
// Logical and expression query operators
// ---------------------------------------------------------------------------

fn sub_queries(name: &str, rhs: &Value, options: &Options) -> Result<Vec<Query>> {
    let items = match rhs {
        Value::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(Error::InvalidQuery(format!(
                "{name} needs a non-empty array"
            )))
        }
    };
    items.iter().map(|item| Query::new(item, options)).collect()
}

fn and_operator() -> QueryOperator {
    Arc::new(|name: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let queries = sub_queries(name, rhs, options)?;
        Ok(Box::new(move |doc: &Value| {
            for q in &queries {
                if !q.test(doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }))
    })
}

fn or_operator() -> QueryOperator {
    Arc::new(|name: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let queries = sub_queries(name, rhs, options)?;
        Ok(Box::new(move |doc: &Value| {
            for q in &queries {
                if q.test(doc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }))
    })
}

fn nor_operator() -> QueryOperator {
    Arc::new(|name: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let queries = sub_queries(name, rhs, options)?;
        Ok(Box::new(move |doc: &Value| {
            for q in &queries {
                if q.test(doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }))
    })
}

fn not_operator() -> QueryOperator {
    Arc::new(|_name: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let query = Query::new(rhs, options)?;
        Ok(Box::new(move |doc: &Value| Ok(!query.test(doc)?)))
    })
}

/// `$expr`: evaluate an aggregation expression against the document.
fn expr_operator() -> QueryOperator {
    Arc::new(|_name: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let expr = Expression::parse(rhs, &options.context)?;
        let options = options.clone();
        Ok(Box::new(move |doc: &Value| {
            let env = Env::new(&options, doc);
            Ok(expr.evaluate(doc, &env)?.is_truthy(options.use_strict_mode))
        }))
    })
}

pub(crate) fn query_operators() -> Vec<(&'static str, Operator)> {
    vec![
        ("$and", Operator::Query(and_operator())),
        ("$or", Operator::Query(or_operator())),
        ("$nor", Operator::Query(nor_operator())),
        ("$not", Operator::Query(not_operator())),
        ("$expr", Operator::Query(expr_operator())),
    ]
}
