//! Partitioning, grouping and window-function evaluation.
//!
//! `$group` and `$setWindowFields` both start by bucketing documents into
//! [`Partition`]s. `$group` folds each partition into one output document
//! through accumulators; `$setWindowFields` keeps every document and
//! attaches, per output field, a value computed over a window of the
//! document's partition.

use std::borrow::Cow;
use std::cell::OnceCell;
use std::collections::HashMap;

use tracing::debug;

use crate::context::{AccumulatorOperator, OperatorCategory, Options, WindowOperator};
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::operators::date_add;
use crate::path::{remove_value, resolve, set_value};
use crate::sort::{parse_sort_spec, sort_documents, SortSpec};
use crate::value::{Document, Value};

/// Documents sharing one partition key, in arrival order.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: Value,
    pub items: Vec<Value>,
}

/// Bucket `docs` by the value of `key`, preserving first-seen key order.
///
/// Buckets are addressed by `options.hash_value`; colliding keys are told
/// apart by equality. A missing key groups with null.
pub fn partition(docs: Vec<Value>, key: &Expression, options: &Options) -> Result<Vec<Partition>> {
    let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut partitions: Vec<Partition> = Vec::new();

    for doc in docs {
        let key_value = key.evaluate(&doc, &Env::new(options, &doc))?.or_null();
        let slot = buckets.entry(options.hash_value(&key_value)).or_default();
        let found = slot.iter().copied().find(|&i| partitions[i].key == key_value);
        match found {
            Some(i) => partitions[i].items.push(doc),
            None => {
                slot.push(partitions.len());
                partitions.push(Partition {
                    key: key_value,
                    items: vec![doc],
                });
            }
        }
    }

    debug!(partitions = partitions.len(), "partitioned documents");
    Ok(partitions)
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

struct Accumulation {
    field: String,
    op: AccumulatorOperator,
    args: Expression,
}

/// Compiled `$group` specification.
pub struct GroupSpec {
    id: Expression,
    fields: Vec<Accumulation>,
}

impl GroupSpec {
    pub fn parse(spec: &Value, options: &Options) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$group needs an object".into()))?;
        let id = map.get(&options.id_key).ok_or_else(|| {
            Error::InvalidPipeline(format!("$group needs an '{}' field", options.id_key))
        })?;
        let id = Expression::parse(id, &options.context)?;

        let mut fields = Vec::with_capacity(map.len().saturating_sub(1));
        for (field, acc) in map {
            if field == &options.id_key {
                continue;
            }
            let (name, args) = single_operator(acc).ok_or_else(|| {
                Error::InvalidPipeline(format!(
                    "$group field '{field}' must be a single accumulator expression"
                ))
            })?;
            let op = options
                .context
                .accumulator_operator(name)
                .cloned()
                .ok_or_else(|| Error::unknown_operator(OperatorCategory::Accumulator, name))?;
            fields.push(Accumulation {
                field: field.clone(),
                op,
                args: Expression::parse(args, &options.context)?,
            });
        }
        Ok(Self { id, fields })
    }

    pub fn run(&self, docs: Vec<Value>, options: &Options) -> Result<Vec<Value>> {
        let partitions = partition(docs, &self.id, options)?;
        let root = Value::Null;
        let mut out = Vec::with_capacity(partitions.len());
        for Partition { key, items } in &partitions {
            let env = Env::new(options, &root).with_group_id(key);
            let mut doc = Document::with_capacity(self.fields.len() + 1);
            doc.insert(options.id_key.clone(), key.clone());
            for acc in &self.fields {
                let value = (acc.op)(items.as_slice(), &acc.args, &env)?;
                doc.insert(acc.field.clone(), value.or_null());
            }
            out.push(Value::Object(doc));
        }
        Ok(out)
    }
}

/// `{"$op": args}` with exactly one operator key.
fn single_operator(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (name, args) = map.first()?;
    name.starts_with('$').then_some((name.as_str(), args))
}

// ---------------------------------------------------------------------------
// $setWindowFields
// ---------------------------------------------------------------------------

/// Operators that read the partition in order.
const SORT_REQUIRED: [&str; 6] = ["$denseRank", "$documentNumber", "$first", "$last", "$rank", "$shift"];

/// Operators that always see the whole partition.
const UNBOUNDED_ONLY: [&str; 5] = ["$denseRank", "$expMovingAvg", "$locf", "$rank", "$shift"];

/// What a window operator receives besides the window itself.
pub struct WindowInput<'a> {
    /// The operator's unevaluated arguments.
    pub args: &'a Expression,
    /// 1-based position of the current document in its partition.
    pub document_number: usize,
    pub field: &'a str,
    pub sort_by: Option<&'a SortSpec>,
    /// The whole (sorted) partition.
    pub partition: &'a [Value],
    /// Per-partition column shared by every call for this output field.
    pub memo: &'a OnceCell<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Boundary {
    Current,
    Unbounded,
    Offset(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundKind {
    Documents,
    Range,
}

#[derive(Debug, Clone)]
struct WindowBounds {
    kind: BoundKind,
    begin: Boundary,
    end: Boundary,
    unit: Option<String>,
}

impl WindowBounds {
    fn is_unbounded(&self) -> bool {
        self.begin == Boundary::Unbounded && self.end == Boundary::Unbounded
    }

    fn parse(spec: &Value) -> Result<Option<Self>> {
        let map = spec
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("'window' must be an object".into()))?;
        if let Some(key) = map.keys().find(|k| !matches!(k.as_str(), "documents" | "range" | "unit")) {
            return Err(Error::InvalidPipeline(format!("unknown window option '{key}'")));
        }
        let (kind, bounds) = match (map.get("documents"), map.get("range")) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidPipeline(
                    "'window' option supports only one of 'documents' or 'range'".into(),
                ))
            }
            (Some(b), None) => (BoundKind::Documents, b),
            (None, Some(b)) => (BoundKind::Range, b),
            (None, None) => {
                if map.contains_key("unit") {
                    return Err(Error::InvalidPipeline("'unit' requires a 'range' window".into()));
                }
                return Ok(None);
            }
        };
        let unit = match map.get("unit") {
            None => None,
            Some(_) if kind == BoundKind::Documents => {
                return Err(Error::InvalidPipeline("'unit' requires a 'range' window".into()))
            }
            Some(Value::String(u)) => Some(u.clone()),
            Some(other) => {
                return Err(Error::InvalidPipeline(format!("invalid window unit {other}")))
            }
        };
        let (begin, end) = match bounds.as_array().map(Vec::as_slice) {
            Some([b, e]) => (parse_boundary(b, kind)?, parse_boundary(e, kind)?),
            _ => {
                return Err(Error::InvalidPipeline(
                    "window boundaries must be a [lower, upper] pair".into(),
                ))
            }
        };
        Ok(Some(Self {
            kind,
            begin,
            end,
            unit,
        }))
    }

    /// Positional slice `[lo, hi)` for document windows and string-only
    /// range windows.
    fn positional(&self, index: usize, len: usize) -> (usize, usize) {
        let lo = match self.begin {
            Boundary::Current => index,
            Boundary::Unbounded => 0,
            Boundary::Offset(n) => (index as f64 + n).max(0.0) as usize,
        };
        let hi = match self.end {
            Boundary::Current => index + 1,
            Boundary::Unbounded => len,
            Boundary::Offset(n) => (index as f64 + n + 1.0).max(0.0) as usize,
        };
        let hi = hi.min(len);
        (lo.min(hi), hi)
    }
}

fn parse_boundary(value: &Value, kind: BoundKind) -> Result<Boundary> {
    match value {
        Value::String(s) if s == "current" => Ok(Boundary::Current),
        Value::String(s) if s == "unbounded" => Ok(Boundary::Unbounded),
        Value::Int(n) => Ok(Boundary::Offset(*n as f64)),
        Value::Float(f) if kind == BoundKind::Range && f.is_finite() => Ok(Boundary::Offset(*f)),
        Value::Float(f) if f.fract() == 0.0 => Ok(Boundary::Offset(*f)),
        other => Err(Error::InvalidPipeline(format!(
            "invalid window boundary {other}; expected 'current', 'unbounded' or {}",
            match kind {
                BoundKind::Documents => "an integer",
                BoundKind::Range => "a number",
            }
        ))),
    }
}

enum WindowFunction {
    Accumulator(AccumulatorOperator),
    Window(WindowOperator),
}

struct WindowOutput {
    field: String,
    func: WindowFunction,
    args: Expression,
    window: Option<WindowBounds>,
}

/// Compiled `$setWindowFields` specification. All validation happens in
/// [`WindowFieldsSpec::parse`], before any document is read.
pub struct WindowFieldsSpec {
    partition_by: Option<Expression>,
    sort_by: Option<SortSpec>,
    outputs: Vec<WindowOutput>,
}

impl WindowFieldsSpec {
    pub fn parse(spec: &Value, options: &Options) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$setWindowFields needs an object".into()))?;
        if let Some(key) = map
            .keys()
            .find(|k| !matches!(k.as_str(), "partitionBy" | "sortBy" | "output"))
        {
            return Err(Error::InvalidPipeline(format!(
                "unknown $setWindowFields option '{key}'"
            )));
        }
        let partition_by = map
            .get("partitionBy")
            .map(|p| Expression::parse(p, &options.context))
            .transpose()?;
        let sort_by = map.get("sortBy").map(parse_sort_spec).transpose()?;
        let output = map
            .get("output")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::InvalidPipeline("$setWindowFields needs an 'output' object".into()))?;

        let mut outputs = Vec::with_capacity(output.len());
        for (field, out_spec) in output {
            outputs.push(parse_output(field, out_spec, sort_by.as_ref(), options)?);
        }
        Ok(Self {
            partition_by,
            sort_by,
            outputs,
        })
    }

    pub fn run(&self, mut docs: Vec<Value>, options: &Options) -> Result<Vec<Value>> {
        if let Some(spec) = &self.sort_by {
            sort_documents(&mut docs, spec, options);
        }
        let partitions = match &self.partition_by {
            Some(key) => partition(docs, key, options)?,
            None => vec![Partition {
                key: Value::Null,
                items: docs,
            }],
        };

        let mut out = Vec::new();
        for mut part in partitions {
            for output in &self.outputs {
                let values = self.compute(output, &part.items, options)?;
                for (doc, value) in part.items.iter_mut().zip(values) {
                    if value.is_missing() {
                        remove_value(doc, &output.field);
                    } else {
                        set_value(doc, &output.field, value);
                    }
                }
            }
            out.extend(part.items);
        }
        Ok(out)
    }

    /// Value of one output field for every document of a partition.
    fn compute(&self, output: &WindowOutput, items: &[Value], options: &Options) -> Result<Vec<Value>> {
        let root = Value::Null;
        let env = Env::new(options, &root);
        let memo = OnceCell::new();
        let mut values = Vec::with_capacity(items.len());
        for (index, current) in items.iter().enumerate() {
            let window = self.window_items(output, items, index, current)?;
            let value = match &output.func {
                WindowFunction::Accumulator(f) => f(&*window, &output.args, &env)?,
                WindowFunction::Window(f) => {
                    let input = WindowInput {
                        args: &output.args,
                        document_number: index + 1,
                        field: &output.field,
                        sort_by: self.sort_by.as_ref(),
                        partition: items,
                        memo: &memo,
                    };
                    f(current, &*window, &input, &env.with_root(current))?
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    fn window_items<'p>(
        &self,
        output: &WindowOutput,
        items: &'p [Value],
        index: usize,
        current: &Value,
    ) -> Result<Cow<'p, [Value]>> {
        let bounds = match &output.window {
            Some(b) if !b.is_unbounded() => b,
            _ => return Ok(Cow::Borrowed(items)),
        };
        let positional = matches!(bounds.begin, Boundary::Current | Boundary::Unbounded)
            && matches!(bounds.end, Boundary::Current | Boundary::Unbounded);
        if bounds.kind == BoundKind::Documents || positional {
            let (lo, hi) = bounds.positional(index, items.len());
            return Ok(Cow::Borrowed(&items[lo..hi]));
        }

        // range window over the single sort key
        let Some(sort_key) = self.sort_by.as_ref().and_then(|s| s.first()).map(|(k, _)| k.as_str())
        else {
            return Ok(Cow::Borrowed(items));
        };
        let current_value = resolve(current, sort_key).unwrap_or(Value::Missing);
        let offset = |boundary: Boundary, infinite: f64| -> Result<f64> {
            let Boundary::Offset(n) = boundary else {
                return Ok(infinite);
            };
            match (&bounds.unit, &current_value) {
                (Some(unit), Value::Date(ms)) => Ok(date_add(*ms, unit, n as i64)? as f64),
                (Some(unit), other) => {
                    debug!(unit = %unit, value = other.type_name(), "range unit over a non-date sort value, window is empty");
                    Ok(f64::NAN)
                }
                (None, v) => Ok(sort_number(v) + n),
            }
        };
        let lower = offset(bounds.begin, f64::NEG_INFINITY)?;
        let upper = offset(bounds.end, f64::INFINITY)?;

        let candidates = match (bounds.begin, bounds.end) {
            (_, Boundary::Current) => &items[..=index],
            (Boundary::Current, _) => &items[index..],
            _ => items,
        };
        let selected = candidates
            .iter()
            .filter(|doc| {
                let n = resolve(doc, sort_key).map_or(f64::NAN, |v| sort_number(&v));
                n >= lower && n <= upper
            })
            .cloned()
            .collect();
        Ok(Cow::Owned(selected))
    }
}

/// Numeric view of a range sort value; dates compare by timestamp.
fn sort_number(value: &Value) -> f64 {
    match value {
        Value::Date(ms) => *ms as f64,
        other => other.as_f64().unwrap_or(f64::NAN),
    }
}

fn parse_output(
    field: &str,
    spec: &Value,
    sort_by: Option<&SortSpec>,
    options: &Options,
) -> Result<WindowOutput> {
    let map = spec.as_object().ok_or_else(|| {
        Error::InvalidPipeline(format!("output '{field}' must be an object"))
    })?;
    let op_keys: Vec<&String> = map.keys().filter(|k| k.starts_with('$')).collect();
    let other_keys = map.keys().filter(|k| !k.starts_with('$'));
    if op_keys.len() != 1 || other_keys.clone().any(|k| k != "window") || map.len() > 2 {
        return Err(Error::InvalidPipeline(format!(
            "output '{field}' should have a single window operator and an optional 'window'"
        )));
    }
    let name = op_keys[0].as_str();
    let raw_args = &map[name];

    let ctx = &options.context;
    let func = match (ctx.accumulator_operator(name), ctx.window_operator(name)) {
        (Some(acc), _) => WindowFunction::Accumulator(acc.clone()),
        (None, Some(win)) => WindowFunction::Window(win.clone()),
        (None, None) => return Err(Error::unknown_operator(OperatorCategory::Window, name)),
    };

    let window = map.get("window").map(WindowBounds::parse).transpose()?.flatten();
    if map.contains_key("window") && UNBOUNDED_ONLY.contains(&name) {
        return Err(Error::InvalidPipeline(format!(
            "{name} does not accept a 'window' field"
        )));
    }
    if sort_by.is_none() {
        if SORT_REQUIRED.contains(&name) {
            return Err(Error::InvalidPipeline(format!("'{name}' requires a sortBy")));
        }
        if window.as_ref().is_some_and(|w| !w.is_unbounded()) {
            return Err(Error::InvalidPipeline(
                "bounded window operation requires a sortBy".into(),
            ));
        }
    }
    if let Some(w) = &window {
        if w.kind == BoundKind::Range && sort_by.map_or(0, |s| s.len()) != 1 {
            return Err(Error::InvalidPipeline(
                "range-based window requires exactly one sortBy field".into(),
            ));
        }
    }

    Ok(WindowOutput {
        field: field.to_string(),
        func,
        args: Expression::parse(raw_args, ctx)?,
        window,
    })
}
