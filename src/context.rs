//! Operator registry and evaluation options.
//!
//! The registry is an explicit value: a `Context` is built (usually from
//! `Context::with_defaults`), optionally extended, then frozen behind an
//! `Arc` inside `Options`. Nothing is registered globally.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::trace;

use crate::error::Result;
use crate::expression::{Env, Expression};
use crate::value::Value;
use crate::window::WindowInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorCategory {
    Query,
    Expression,
    Accumulator,
    Window,
}

impl fmt::Display for OperatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorCategory::Query => "query",
            OperatorCategory::Expression => "expression",
            OperatorCategory::Accumulator => "accumulator",
            OperatorCategory::Window => "window",
        };
        f.write_str(name)
    }
}

/// Compiled test for one document.
pub type Matcher = Box<dyn Fn(&Value) -> Result<bool> + Send + Sync>;

/// `(field, operand, options)` compiled into a matcher.
pub type QueryOperator = Arc<dyn Fn(&str, &Value, &Options) -> Result<Matcher> + Send + Sync>;

/// `(current document, unevaluated args, environment)`.
pub type ExpressionOperator =
    Arc<dyn Fn(&Value, &Expression, &Env<'_>) -> Result<Value> + Send + Sync>;

/// `(collection, unevaluated args, environment)`; the expression is
/// evaluated against each member of the collection.
pub type AccumulatorOperator =
    Arc<dyn Fn(&[Value], &Expression, &Env<'_>) -> Result<Value> + Send + Sync>;

/// `(current document, window, input, environment)`.
pub type WindowOperator =
    Arc<dyn Fn(&Value, &[Value], &WindowInput<'_>, &Env<'_>) -> Result<Value> + Send + Sync>;

pub type HashFunction = Arc<dyn Fn(&Value) -> u64 + Send + Sync>;

/// Looks up a named collection for `$lookup`.
pub type CollectionResolver = Arc<dyn Fn(&str) -> Option<Vec<Value>> + Send + Sync>;

/// An implementation tagged with the category it registers under.
#[derive(Clone)]
pub enum Operator {
    Query(QueryOperator),
    Expression(ExpressionOperator),
    Accumulator(AccumulatorOperator),
    Window(WindowOperator),
}

impl Operator {
    pub fn category(&self) -> OperatorCategory {
        match self {
            Operator::Query(_) => OperatorCategory::Query,
            Operator::Expression(_) => OperatorCategory::Expression,
            Operator::Accumulator(_) => OperatorCategory::Accumulator,
            Operator::Window(_) => OperatorCategory::Window,
        }
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator({})", self.category())
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Context {
    query: HashMap<String, QueryOperator>,
    expression: HashMap<String, ExpressionOperator>,
    accumulator: HashMap<String, AccumulatorOperator>,
    window: HashMap<String, WindowOperator>,
}

impl Context {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in operator.
    pub fn with_defaults() -> Self {
        let mut ctx = Self::new();
        crate::operators::register_defaults(&mut ctx);
        ctx
    }

    /// Register (or replace) one operator under its category.
    pub fn add_operator(&mut self, name: impl Into<String>, op: Operator) -> &mut Self {
        let name = name.into();
        trace!(category = %op.category(), name = %name, "registered operator");
        match op {
            Operator::Query(f) => {
                self.query.insert(name, f);
            }
            Operator::Expression(f) => {
                self.expression.insert(name, f);
            }
            Operator::Accumulator(f) => {
                self.accumulator.insert(name, f);
            }
            Operator::Window(f) => {
                self.window.insert(name, f);
            }
        }
        self
    }

    pub fn add_operators<I, S>(&mut self, ops: I) -> &mut Self
    where
        I: IntoIterator<Item = (S, Operator)>,
        S: Into<String>,
    {
        for (name, op) in ops {
            self.add_operator(name, op);
        }
        self
    }

    pub fn add_query_operator(&mut self, name: impl Into<String>, op: QueryOperator) -> &mut Self {
        self.add_operator(name, Operator::Query(op))
    }

    pub fn add_expression_operator(
        &mut self,
        name: impl Into<String>,
        op: ExpressionOperator,
    ) -> &mut Self {
        self.add_operator(name, Operator::Expression(op))
    }

    pub fn add_accumulator_operator(
        &mut self,
        name: impl Into<String>,
        op: AccumulatorOperator,
    ) -> &mut Self {
        self.add_operator(name, Operator::Accumulator(op))
    }

    pub fn add_window_operator(&mut self, name: impl Into<String>, op: WindowOperator) -> &mut Self {
        self.add_operator(name, Operator::Window(op))
    }

    pub fn get_operator(&self, category: OperatorCategory, name: &str) -> Option<Operator> {
        match category {
            OperatorCategory::Query => self.query.get(name).cloned().map(Operator::Query),
            OperatorCategory::Expression => {
                self.expression.get(name).cloned().map(Operator::Expression)
            }
            OperatorCategory::Accumulator => {
                self.accumulator.get(name).cloned().map(Operator::Accumulator)
            }
            OperatorCategory::Window => self.window.get(name).cloned().map(Operator::Window),
        }
    }

    pub fn query_operator(&self, name: &str) -> Option<&QueryOperator> {
        self.query.get(name)
    }

    pub fn expression_operator(&self, name: &str) -> Option<&ExpressionOperator> {
        self.expression.get(name)
    }

    pub fn accumulator_operator(&self, name: &str) -> Option<&AccumulatorOperator> {
        self.accumulator.get(name)
    }

    pub fn window_operator(&self, name: &str) -> Option<&WindowOperator> {
        self.window.get(name)
    }

    pub fn contains(&self, category: OperatorCategory, name: &str) -> bool {
        match category {
            OperatorCategory::Query => self.query.contains_key(name),
            OperatorCategory::Expression => self.expression.contains_key(name),
            OperatorCategory::Accumulator => self.accumulator.contains_key(name),
            OperatorCategory::Window => self.window.contains_key(name),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("query", &self.query.len())
            .field("expression", &self.expression.len())
            .field("accumulator", &self.accumulator.len())
            .field("window", &self.window.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// String comparison settings for sorting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collation {
    pub locale: String,
    /// 1 and 2 compare case-insensitively; 3 (the default) is exact.
    #[serde(default = "default_strength")]
    pub strength: u8,
}

fn default_strength() -> u8 {
    3
}

impl Collation {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            strength: default_strength(),
        }
    }

    pub fn with_strength(mut self, strength: u8) -> Self {
        self.strength = strength;
        self
    }

    pub fn case_insensitive(&self) -> bool {
        self.strength < 3
    }
}

#[derive(Clone)]
pub struct Options {
    /// Key holding document identity; `$group` writes the group key here.
    pub id_key: String,
    pub collation: Option<Collation>,
    /// MongoDB truthiness: the empty string and NaN are true.
    pub use_strict_mode: bool,
    /// Custom hash for grouping and set operations.
    pub hash_function: Option<HashFunction>,
    pub collection_resolver: Option<CollectionResolver>,
    pub context: Arc<Context>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            id_key: "_id".to_string(),
            collation: None,
            use_strict_mode: true,
            hash_function: None,
            collection_resolver: None,
            context: Arc::new(Context::with_defaults()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OptionsConfig {
    id_key: String,
    use_strict_mode: bool,
    collation: Option<Collation>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            id_key: "_id".to_string(),
            use_strict_mode: true,
            collation: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the serializable settings from JSON, e.g.
    /// `{"idKey": "id", "useStrictMode": false, "collation": {"locale": "en", "strength": 2}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: OptionsConfig = serde_json::from_str(json)?;
        Ok(Self {
            id_key: config.id_key,
            use_strict_mode: config.use_strict_mode,
            collation: config.collation,
            ..Self::default()
        })
    }

    pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
        self.id_key = id_key.into();
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.use_strict_mode = strict;
        self
    }

    pub fn with_hash_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> u64 + Send + Sync + 'static,
    {
        self.hash_function = Some(Arc::new(f));
        self
    }

    pub fn with_collection_resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Option<Vec<Value>> + Send + Sync + 'static,
    {
        self.collection_resolver = Some(Arc::new(f));
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Arc::new(context);
        self
    }

    /// Hash used for partitioning and set semantics.
    pub fn hash_value(&self, value: &Value) -> u64 {
        match &self.hash_function {
            Some(f) => f(value),
            None => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                value.hash(&mut hasher);
                hasher.finish()
            }
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("id_key", &self.id_key)
            .field("collation", &self.collation)
            .field("use_strict_mode", &self.use_strict_mode)
            .field("hash_function", &self.hash_function.is_some())
            .field("collection_resolver", &self.collection_resolver.is_some())
            .field("context", &self.context)
            .finish()
    }
}
