//! Expression parsing and evaluation.
//!
//! A raw expression is parsed once into an [`Expression`] tree; operator
//! names are looked up at parse time so an unknown operator fails before
//! any document is read. Evaluation walks the tree against the current
//! document and an [`Env`] holding the root document, the scope chain of
//! bound variables and the current group id.

use std::fmt;

use chrono::Utc;

use crate::context::{Context, ExpressionOperator, OperatorCategory, Options};
use crate::error::{Error, Result};
use crate::path::resolve;
use crate::value::{Document, Value};

#[derive(Clone)]
pub enum Expression {
    Literal(Value),
    /// `$a.b`, stored without the leading `$`.
    FieldRef(String),
    /// `$$name` or `$$name.path`.
    Variable { name: String, path: Option<String> },
    Operator {
        name: String,
        op: ExpressionOperator,
        args: Box<Expression>,
    },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(v) => write!(f, "Literal({v})"),
            Expression::FieldRef(p) => write!(f, "FieldRef(${p})"),
            Expression::Variable { name, path: None } => write!(f, "Variable($${name})"),
            Expression::Variable {
                name,
                path: Some(path),
            } => write!(f, "Variable($${name}.{path})"),
            Expression::Operator { name, args, .. } => {
                f.debug_struct("Operator").field("name", name).field("args", args).finish()
            }
            Expression::Object(fields) => f.debug_map().entries(fields.iter().map(|(k, v)| (k, v))).finish(),
            Expression::Array(items) => f.debug_list().entries(items).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Expression {
    pub fn parse(raw: &Value, ctx: &Context) -> Result<Expression> {
        match raw {
            Value::String(s) if s.starts_with("$$") => parse_variable(&s[2..]),
            Value::String(s) if s.len() > 1 && s.starts_with('$') => {
                Ok(Expression::FieldRef(s[1..].to_string()))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| Expression::parse(item, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Expression::Array),
            Value::Object(map) => parse_object(map, ctx),
            other => Ok(Expression::Literal(other.clone())),
        }
    }

    /// Reference to a field of the current document.
    pub fn field(path: impl Into<String>) -> Expression {
        Expression::FieldRef(path.into())
    }

    pub fn literal(value: impl Into<Value>) -> Expression {
        Expression::Literal(value.into())
    }

    /// Named argument of an object-form operator argument.
    pub fn arg(&self, name: &str) -> Option<&Expression> {
        match self {
            Expression::Object(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, e)| e),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[Expression]> {
        match self {
            Expression::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expression::Literal(v) => Some(v),
            _ => None,
        }
    }
}

fn parse_variable(body: &str) -> Result<Expression> {
    let (name, path) = match body.split_once('.') {
        Some((name, path)) => (name, Some(path.to_string())),
        None => (body, None),
    };
    if name.is_empty() {
        return Err(Error::InvalidExpression(format!(
            "empty variable name in '$${body}'"
        )));
    }
    Ok(Expression::Variable {
        name: name.to_string(),
        path,
    })
}

fn parse_object(map: &Document, ctx: &Context) -> Result<Expression> {
    let has_operator = map.keys().any(|k| k.starts_with('$'));
    if !has_operator {
        let fields = map
            .iter()
            .map(|(k, v)| Ok((k.clone(), Expression::parse(v, ctx)?)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Expression::Object(fields));
    }
    if map.len() != 1 {
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        return Err(Error::InvalidExpression(format!(
            "an operator expression must have exactly one key, found {keys:?}"
        )));
    }
    let Some((name, args)) = map.first() else {
        return Ok(Expression::Object(Vec::new()));
    };
    if name == "$literal" {
        return Ok(Expression::Literal(args.clone()));
    }
    let op = ctx
        .expression_operator(name)
        .ok_or_else(|| Error::unknown_operator(OperatorCategory::Expression, name))?
        .clone();
    Ok(Expression::Operator {
        name: name.clone(),
        op,
        args: Box::new(Expression::parse(args, ctx)?),
    })
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One frame of bound variables. Frames link to their parent and are
/// dropped with the evaluation call that pushed them.
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    vars: Vec<(String, Value)>,
}

#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub options: &'a Options,
    /// Outermost document of the evaluation (`$$ROOT`).
    pub root: &'a Value,
    /// Key of the group being accumulated, when inside `$group`.
    pub group_id: Option<&'a Value>,
    scope: Option<&'a Scope<'a>>,
}

impl<'a> Env<'a> {
    pub fn new(options: &'a Options, root: &'a Value) -> Self {
        Self {
            options,
            root,
            group_id: None,
            scope: None,
        }
    }

    pub fn with_root(self, root: &'a Value) -> Self {
        Self { root, ..self }
    }

    pub fn with_group_id(self, group_id: &'a Value) -> Self {
        Self {
            group_id: Some(group_id),
            ..self
        }
    }

    pub fn strict(&self) -> bool {
        self.options.use_strict_mode
    }

    /// Run `f` with `vars` bound on top of the current scope.
    pub fn with_vars<R>(&self, vars: Vec<(String, Value)>, f: impl FnOnce(&Env<'_>) -> R) -> R {
        let scope = Scope {
            parent: self.scope,
            vars,
        };
        let env = Env {
            scope: Some(&scope),
            ..*self
        };
        f(&env)
    }

    fn lookup(&self, name: &str) -> Option<&'a Value> {
        let mut scope = self.scope;
        while let Some(frame) = scope {
            if let Some((_, v)) = frame.vars.iter().rev().find(|(k, _)| k == name) {
                return Some(v);
            }
            scope = frame.parent;
        }
        None
    }

    fn variable(&self, doc: &Value, name: &str, path: Option<&str>) -> Result<Value> {
        let at_path = |base: &Value| match path {
            Some(p) => Value::from(resolve(base, p)),
            None => base.clone(),
        };
        if let Some(bound) = self.lookup(name) {
            return Ok(at_path(bound));
        }
        match name {
            "ROOT" => Ok(at_path(self.root)),
            "CURRENT" => Ok(at_path(doc)),
            "REMOVE" => Ok(Value::Missing),
            "NOW" => Ok(at_path(&Value::Date(Utc::now().timestamp_millis()))),
            _ => Err(Error::UndefinedVariable(name.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expression {
    pub fn evaluate(&self, doc: &Value, env: &Env<'_>) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::FieldRef(path) => Ok(Value::from(resolve(doc, path))),
            Expression::Variable { name, path } => env.variable(doc, name, path.as_deref()),
            Expression::Operator { op, args, .. } => op(doc, args, env),
            Expression::Object(fields) => {
                let mut out = Document::with_capacity(fields.len());
                for (key, expr) in fields {
                    let value = expr.evaluate(doc, env)?;
                    if !value.is_missing() {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(Value::Object(out))
            }
            Expression::Array(items) => items
                .iter()
                .map(|item| item.evaluate(doc, env).map(Value::or_null))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

impl Expression {
    /// Evaluate positional operator arguments, keeping `Missing` results.
    /// A non-array argument is a single positional argument.
    pub fn evaluate_args(&self, doc: &Value, env: &Env<'_>) -> Result<Vec<Value>> {
        match self {
            Expression::Array(items) => items.iter().map(|item| item.evaluate(doc, env)).collect(),
            other => Ok(vec![other.evaluate(doc, env)?]),
        }
    }
}

/// Parse and evaluate `expr` against `doc` in one step.
pub fn compute_value(doc: &Value, expr: &Value, options: &Options) -> Result<Value> {
    let parsed = Expression::parse(expr, &options.context)?;
    parsed.evaluate(doc, &Env::new(options, doc))
}
