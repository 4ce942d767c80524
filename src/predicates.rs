//! Comparison predicates shared by query and expression operators.
//!
//! A predicate is a plain function `(lhs, rhs, options) -> Result<bool>`.
//! [`create_query_operator`] and [`create_expression_operator`] turn one
//! into a registrable operator of either category.

use std::cmp::Ordering;
use std::sync::Arc;

use regex::Regex;

use crate::context::{ExpressionOperator, Matcher, Operator, Options, QueryOperator};
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::path::{resolve_with, ResolveOptions};
use crate::query::Query;
use crate::value::{Document, Value};

pub type Predicate = fn(&Value, &Value, &Options) -> Result<bool>;

/// Query operator that resolves the selector on each document, then applies
/// `pred`. The operand is checked once at compile time by running the
/// predicate against a missing field.
pub fn create_query_operator(pred: Predicate) -> QueryOperator {
    Arc::new(move |field: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        pred(&Value::Missing, rhs, options)?;
        let field = field.to_string();
        let rhs = rhs.clone();
        let options = options.clone();
        Ok(Box::new(move |doc: &Value| {
            let lhs = Value::from(resolve_with(doc, &field, ResolveOptions::query()));
            pred(&lhs, &rhs, &options)
        }))
    })
}

/// Expression operator that evaluates its two arguments, then applies `pred`.
pub fn create_expression_operator(pred: Predicate) -> ExpressionOperator {
    Arc::new(move |doc: &Value, args: &Expression, env: &Env<'_>| {
        let values = args.evaluate_args(doc, env)?;
        match values.as_slice() {
            [lhs, rhs] => pred(lhs, rhs, env.options).map(Value::Bool),
            _ => Err(Error::InvalidExpression(format!(
                "comparison takes exactly 2 arguments, got {}",
                values.len()
            ))),
        }
    })
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Equality with array membership: an array lhs matches when any element
/// (or any element of a nested array) equals `b`. Null and missing are equal.
pub fn eq(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(loose_eq(a, b))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b || (a.is_nil() && b.is_nil()) {
        return true;
    }
    match a {
        Value::Array(items) => {
            items.iter().any(|v| v == b)
                || items.iter().flat_map(Value::as_items).any(|v| v == b)
        }
        _ => false,
    }
}

pub fn ne(a: &Value, b: &Value, options: &Options) -> Result<bool> {
    eq(a, b, options).map(|m| !m)
}

pub fn in_list(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    let list = b
        .as_array()
        .ok_or_else(|| Error::InvalidQuery("$in/$nin needs an array".into()))?;
    if a.is_nil() {
        return Ok(list.iter().any(Value::is_null));
    }
    Ok(list.contains(a) || a.as_items().iter().any(|x| list.contains(x)))
}

pub fn not_in_list(a: &Value, b: &Value, options: &Options) -> Result<bool> {
    in_list(a, b, options).map(|m| !m)
}

/// Any lhs item of the same type class as `b` whose ordering satisfies `f`.
fn compare_items(a: &Value, b: &Value, f: fn(Ordering) -> bool) -> bool {
    a.as_items()
        .iter()
        .any(|x| x.same_type_class(b) && f(x.compare(b)))
}

pub fn lt(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(compare_items(a, b, Ordering::is_lt))
}

pub fn lte(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(compare_items(a, b, Ordering::is_le))
}

pub fn gt(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(compare_items(a, b, Ordering::is_gt))
}

pub fn gte(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(compare_items(a, b, Ordering::is_ge))
}

/// `[divisor, remainder]`.
pub fn modulo(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    let (divisor, remainder) = match b.as_array().map(Vec::as_slice) {
        Some([d, r]) => match (d.as_f64(), r.as_f64()) {
            (Some(d), Some(r)) if d != 0.0 => (d.trunc(), r.trunc()),
            _ => {
                return Err(Error::InvalidQuery(
                    "$mod needs a non-zero numeric divisor and a numeric remainder".into(),
                ))
            }
        },
        _ => {
            return Err(Error::InvalidQuery(
                "$mod needs an array of [divisor, remainder]".into(),
            ))
        }
    };
    Ok(a.as_items()
        .iter()
        .filter_map(Value::as_f64)
        .any(|x| x.trunc() % divisor == remainder))
}

pub fn size(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    let n = b
        .as_i64()
        .filter(|n| *n >= 0)
        .ok_or_else(|| Error::InvalidQuery("$size needs a non-negative integer".into()))?;
    Ok(matches!(a, Value::Array(items) if items.len() as i64 == n))
}

pub fn exists(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    Ok(a.is_missing() != b.is_truthy(false))
}

pub fn type_of(a: &Value, b: &Value, _options: &Options) -> Result<bool> {
    match b {
        Value::Array(aliases) => {
            let mut matched = false;
            for alias in aliases {
                matched |= type_alias_matches(a, alias)?;
            }
            Ok(matched)
        }
        alias => type_alias_matches(a, alias),
    }
}

fn type_alias_matches(a: &Value, alias: &Value) -> Result<bool> {
    let check: fn(&Value) -> bool = match alias {
        Value::String(name) => match name.as_str() {
            "array" => Value::is_array,
            "bool" | "boolean" => |v| matches!(v, Value::Bool(_)),
            "date" => |v| matches!(v, Value::Date(_)),
            "number" | "int" | "long" | "double" | "decimal" => Value::is_number,
            "null" => Value::is_null,
            "object" => Value::is_object,
            "string" => |v| matches!(v, Value::String(_)),
            "undefined" => Value::is_nil,
            "regex" | "regexp" => |_| false,
            other => {
                return Err(Error::InvalidQuery(format!("unknown $type alias '{other}'")));
            }
        },
        number if number.is_number() => match number.as_i64() {
            Some(1 | 16 | 18 | 19) => Value::is_number,
            Some(2) => |v| matches!(v, Value::String(_)),
            Some(3) => Value::is_object,
            Some(4) => Value::is_array,
            Some(6) => Value::is_nil,
            Some(8) => |v| matches!(v, Value::Bool(_)),
            Some(9) => |v| matches!(v, Value::Date(_)),
            Some(10) => Value::is_null,
            Some(11) => |_| false,
            _ => return Err(Error::InvalidQuery(format!("unknown $type code {number}"))),
        },
        other => return Err(Error::InvalidQuery(format!("invalid $type operand {other}"))),
    };
    Ok(check(a))
}

// ---------------------------------------------------------------------------
// Compiled query operators
// ---------------------------------------------------------------------------

/// `$regex`; the operand is a pattern string (inline flags already folded in).
fn regex_operator() -> QueryOperator {
    Arc::new(|field: &str, rhs: &Value, _options: &Options| -> Result<Matcher> {
        let pattern = rhs
            .as_str()
            .ok_or_else(|| Error::InvalidQuery("$regex needs a string pattern".into()))?;
        let re = Regex::new(pattern)?;
        let field = field.to_string();
        Ok(Box::new(move |doc: &Value| {
            let lhs = resolve_with(doc, &field, ResolveOptions::query()).unwrap_or_default();
            Ok(lhs
                .as_items()
                .iter()
                .flat_map(Value::as_items)
                .any(|x| x.as_str().is_some_and(|s| re.is_match(s))))
        }))
    })
}

/// Build the pattern for `$regex`, folding `$options` into inline flags.
pub fn regex_pattern(pattern: &Value, flags: Option<&Value>) -> Result<String> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::InvalidQuery("$regex needs a string pattern".into()))?;
    let flags = match flags {
        None => "",
        Some(Value::String(f)) => f.as_str(),
        Some(_) => return Err(Error::InvalidQuery("$options must be a string".into())),
    };
    if let Some(bad) = flags.chars().find(|c| !matches!(c, 'i' | 'm' | 's' | 'x')) {
        return Err(Error::InvalidQuery(format!("unsupported regex option '{bad}'")));
    }
    if flags.is_empty() {
        Ok(pattern.to_string())
    } else {
        Ok(format!("(?{flags}){pattern}"))
    }
}

/// Sub-query run against array elements.
///
/// When every criteria key is a non-boolean operator the criteria describe
/// the element itself, so they are wrapped as `{temp: criteria}` and each
/// element is tested as `{temp: element}`.
struct ElementQuery {
    query: Query,
    wrapped: bool,
}

impl ElementQuery {
    fn compile(criteria: &Value, options: &Options) -> Result<Self> {
        let map = criteria
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("$elemMatch needs an object".into()))?;
        let wrapped = !map.is_empty()
            && map
                .keys()
                .all(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor"));
        let query = if wrapped {
            Query::new(&wrap_temp(criteria.clone()), options)?
        } else {
            Query::new(criteria, options)?
        };
        Ok(Self { query, wrapped })
    }

    fn any(&self, items: &[Value]) -> Result<bool> {
        for item in items {
            let matched = if self.wrapped {
                self.query.test(&wrap_temp(item.clone()))?
            } else {
                self.query.test(item)?
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn wrap_temp(value: Value) -> Value {
    let mut doc = Document::with_capacity(1);
    doc.insert("temp".to_string(), value);
    Value::Object(doc)
}

fn elem_match_operator() -> QueryOperator {
    Arc::new(|field: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let element_query = ElementQuery::compile(rhs, options)?;
        let field = field.to_string();
        Ok(Box::new(move |doc: &Value| {
            match resolve_with(doc, &field, ResolveOptions::query()) {
                Some(Value::Array(items)) => element_query.any(&items),
                _ => Ok(false),
            }
        }))
    })
}

enum AllTerm {
    Equal(Value),
    ElemMatch(ElementQuery),
}

/// `$all`; members may be plain values or `{$elemMatch: ...}` documents.
fn all_operator() -> QueryOperator {
    Arc::new(|field: &str, rhs: &Value, options: &Options| -> Result<Matcher> {
        let members = rhs
            .as_array()
            .ok_or_else(|| Error::InvalidQuery("$all needs an array".into()))?;
        let mut terms = Vec::with_capacity(members.len());
        for member in members {
            match member.get("$elemMatch") {
                Some(criteria) => terms.push(AllTerm::ElemMatch(ElementQuery::compile(criteria, options)?)),
                None => terms.push(AllTerm::Equal(member.clone())),
            }
        }
        let field = field.to_string();
        Ok(Box::new(move |doc: &Value| {
            let Some(Value::Array(values)) = resolve_with(doc, &field, ResolveOptions::query())
            else {
                return Ok(false);
            };
            if values.is_empty() || terms.is_empty() {
                return Ok(false);
            }
            for term in &terms {
                let matched = match term {
                    AllTerm::Equal(v) => values.contains(v),
                    AllTerm::ElemMatch(q) => q.any(&values)?,
                };
                if !matched {
                    return Ok(false);
                }
            }
            Ok(true)
        }))
    })
}

/// Field-level query operators.
pub(crate) fn query_operators() -> Vec<(&'static str, Operator)> {
    let from_predicate = |pred: Predicate| Operator::Query(create_query_operator(pred));
    vec![
        ("$eq", from_predicate(eq)),
        ("$ne", from_predicate(ne)),
        ("$in", from_predicate(in_list)),
        ("$nin", from_predicate(not_in_list)),
        ("$lt", from_predicate(lt)),
        ("$lte", from_predicate(lte)),
        ("$gt", from_predicate(gt)),
        ("$gte", from_predicate(gte)),
        ("$mod", from_predicate(modulo)),
        ("$size", from_predicate(size)),
        ("$exists", from_predicate(exists)),
        ("$type", from_predicate(type_of)),
        ("$regex", Operator::Query(regex_operator())),
        ("$elemMatch", Operator::Query(elem_match_operator())),
        ("$all", Operator::Query(all_operator())),
    ]
}

/// Comparison operators in expression form.
pub(crate) fn expression_operators() -> Vec<(&'static str, Operator)> {
    let from_predicate = |pred: Predicate| Operator::Expression(create_expression_operator(pred));
    vec![
        ("$eq", from_predicate(eq)),
        ("$ne", from_predicate(ne)),
        ("$lt", from_predicate(lt)),
        ("$lte", from_predicate(lte)),
        ("$gt", from_predicate(gt)),
        ("$gte", from_predicate(gte)),
    ]
}
