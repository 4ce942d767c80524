//! Aggregation pipelines.
//!
//! [`Pipeline::parse`] validates every stage and compiles its queries and
//! expressions up front; [`Pipeline::stream`] then wires the stages onto a
//! [`Lazy`] sequence. Streaming stages (`$match`, `$project`, `$unwind`,
//! `$skip`, `$limit`, ...) handle one document per pull; `$sort`, `$group`,
//! `$count`, `$sortByCount` and `$setWindowFields` drain their upstream on
//! the first pull.

use tracing::{debug, trace};

use crate::context::Options;
use crate::error::{Error, Result};
use crate::expression::{Env, Expression};
use crate::lazy::Lazy;
use crate::path::{remove_value, resolve, resolve_with, set_value, ResolveOptions};
use crate::predicates;
use crate::query::Query;
use crate::sort::{parse_sort_spec, sort_documents, SortOrder, SortSpec};
use crate::value::{Document, Value};
use crate::window::{GroupSpec, WindowFieldsSpec};

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
    Nested(Projection),
}

struct Projection {
    fields: Vec<(String, ProjectionField)>,
    inclusion: bool,
    /// Key that is kept unless excluded (only at the top level).
    id_key: Option<String>,
}

impl Projection {
    fn parse(spec: &Value, options: &Options, top_level: bool) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
        if obj.is_empty() {
            return Err(Error::InvalidPipeline(
                "$project requires at least one output field".into(),
            ));
        }
        let id_key = top_level.then(|| options.id_key.clone());

        let mut fields = Vec::with_capacity(obj.len());
        for (field, value) in obj {
            let pf = match value {
                Value::Bool(true) => ProjectionField::Include,
                Value::Bool(false) => ProjectionField::Exclude,
                v if v.is_number() => match v.as_f64() {
                    Some(n) if n == 0.0 => ProjectionField::Exclude,
                    _ => ProjectionField::Include,
                },
                Value::Object(map) if !map.is_empty() && !map.keys().any(|k| k.starts_with('$')) => {
                    ProjectionField::Nested(Projection::parse(value, options, false)?)
                }
                other => ProjectionField::Compute(Expression::parse(other, &options.context)?),
            };
            fields.push((field.clone(), pf));
        }

        let is_id = |name: &str| id_key.as_deref() == Some(name);
        let includes = fields.iter().any(|(name, pf)| match pf {
            ProjectionField::Include | ProjectionField::Compute(_) => !is_id(name),
            ProjectionField::Nested(p) => p.inclusion,
            ProjectionField::Exclude => false,
        });
        let excludes = fields.iter().any(|(name, pf)| match pf {
            ProjectionField::Exclude => !is_id(name),
            ProjectionField::Nested(p) => !p.inclusion,
            _ => false,
        });
        if includes && excludes {
            return Err(Error::InvalidPipeline(
                "$project cannot mix inclusion and exclusion".into(),
            ));
        }
        // `{_id: 0}` alone is an exclusion; `{_id: 1}` alone keeps only the id
        let inclusion = includes
            || fields
                .iter()
                .all(|(_, pf)| matches!(pf, ProjectionField::Include | ProjectionField::Compute(_)));

        Ok(Self {
            fields,
            inclusion,
            id_key,
        })
    }

    fn apply(&self, doc: &Value, options: &Options) -> Result<Value> {
        let Some(map) = doc.as_object() else {
            return Ok(doc.clone());
        };
        if !self.inclusion {
            let mut out = doc.clone();
            for (name, pf) in &self.fields {
                match pf {
                    ProjectionField::Exclude => remove_value(&mut out, name),
                    ProjectionField::Nested(p) => {
                        if let Some(sub) = map.get(name) {
                            let projected = p.apply_nested(sub, options)?;
                            set_value(&mut out, name, projected);
                        }
                    }
                    _ => {}
                }
            }
            return Ok(out);
        }

        let mut out = Value::Object(Document::new());
        if let Some(id_key) = &self.id_key {
            let excluded = self
                .fields
                .iter()
                .any(|(name, pf)| name == id_key && matches!(pf, ProjectionField::Exclude));
            if let (false, Some(id)) = (excluded, map.get(id_key)) {
                set_value(&mut out, id_key, id.clone());
            }
        }
        let env = Env::new(options, doc);
        for (name, pf) in &self.fields {
            match pf {
                ProjectionField::Include => {
                    if let Some(value) = resolve(doc, name) {
                        set_value(&mut out, name, value);
                    }
                }
                ProjectionField::Compute(expr) => {
                    let value = expr.evaluate(doc, &env)?;
                    if !value.is_missing() {
                        set_value(&mut out, name, value);
                    }
                }
                ProjectionField::Nested(p) => {
                    if let Some(sub) = map.get(name) {
                        let projected = p.apply_nested(sub, options)?;
                        set_value(&mut out, name, projected);
                    }
                }
                ProjectionField::Exclude => {}
            }
        }
        Ok(out)
    }

    /// Apply to an embedded document, or to every document of an array.
    fn apply_nested(&self, value: &Value, options: &Options) -> Result<Value> {
        match value {
            Value::Array(items) => items
                .iter()
                .filter(|item| !self.inclusion || item.is_object())
                .map(|item| self.apply(item, options))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => self.apply(other, options),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage specs
// ---------------------------------------------------------------------------

struct UnwindSpec {
    path: String,
    include_array_index: Option<String>,
    preserve_null_and_empty: bool,
}

impl UnwindSpec {
    fn parse(spec: &Value) -> Result<Self> {
        let (path, index, preserve) = match spec {
            Value::String(path) => (path.as_str(), None, false),
            Value::Object(map) => {
                let path = map.get("path").and_then(Value::as_str).ok_or_else(|| {
                    Error::InvalidPipeline("$unwind requires a 'path' string".into())
                })?;
                let index = match map.get("includeArrayIndex") {
                    None => None,
                    Some(Value::String(s)) if !s.is_empty() && !s.starts_with('$') => Some(s.clone()),
                    Some(_) => {
                        return Err(Error::InvalidPipeline(
                            "'includeArrayIndex' must be a field name".into(),
                        ))
                    }
                };
                let preserve = match map.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => {
                        return Err(Error::InvalidPipeline(
                            "'preserveNullAndEmptyArrays' must be a boolean".into(),
                        ))
                    }
                };
                (path, index, preserve)
            }
            _ => {
                return Err(Error::InvalidPipeline(
                    "$unwind takes a field path or an object".into(),
                ))
            }
        };
        let path = path.strip_prefix('$').filter(|p| !p.is_empty()).ok_or_else(|| {
            Error::InvalidPipeline(format!("$unwind path must start with '$', got '{path}'"))
        })?;
        Ok(Self {
            path: path.to_string(),
            include_array_index: index,
            preserve_null_and_empty: preserve,
        })
    }

    fn apply(&self, doc: Value) -> Vec<Value> {
        let with_index = |mut doc: Value, index: Value| {
            if let Some(field) = &self.include_array_index {
                set_value(&mut doc, field, index);
            }
            doc
        };
        match resolve(&doc, &self.path) {
            Some(Value::Array(items)) if !items.is_empty() => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut out = doc.clone();
                    set_value(&mut out, &self.path, item);
                    with_index(out, Value::from(i))
                })
                .collect(),
            Some(Value::Array(_)) if self.preserve_null_and_empty => {
                let mut out = doc;
                set_value(&mut out, &self.path, Value::Null);
                vec![with_index(out, Value::Null)]
            }
            Some(Value::Array(_)) => Vec::new(),
            None | Some(Value::Null) if self.preserve_null_and_empty => {
                vec![with_index(doc, Value::Null)]
            }
            None | Some(Value::Null) => Vec::new(),
            Some(_) => vec![with_index(doc, Value::Null)],
        }
    }
}

enum LookupSource {
    Named(String),
    Inline(Vec<Value>),
}

struct LookupSpec {
    from: LookupSource,
    local_field: String,
    foreign_field: String,
    as_field: String,
}

impl LookupSpec {
    fn parse(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$lookup must be an object".into()))?;
        let text = |key: &str| -> Result<String> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidPipeline(format!("$lookup requires '{key}' string")))
        };
        let from = match obj.get("from") {
            Some(Value::String(name)) => LookupSource::Named(name.clone()),
            Some(Value::Array(docs)) => LookupSource::Inline(docs.clone()),
            _ => {
                return Err(Error::InvalidPipeline(
                    "$lookup requires 'from' as a collection name or an array".into(),
                ))
            }
        };
        Ok(Self {
            from,
            local_field: text("localField")?,
            foreign_field: text("foreignField")?,
            as_field: text("as")?,
        })
    }

    fn foreign(&self, options: &Options) -> Result<Vec<Value>> {
        match &self.from {
            LookupSource::Inline(docs) => Ok(docs.clone()),
            LookupSource::Named(name) => options
                .collection_resolver
                .as_ref()
                .and_then(|resolver| resolver(name))
                .ok_or_else(|| Error::InvalidPipeline(format!("$lookup: unknown collection '{name}'"))),
        }
    }

    fn join(&self, mut doc: Value, foreign: &[Value], options: &Options) -> Result<Value> {
        let local = resolve(&doc, &self.local_field).unwrap_or(Value::Missing);
        let mut matched = Vec::new();
        for candidate in foreign {
            let value = Value::from(resolve_with(candidate, &self.foreign_field, ResolveOptions::query()));
            let mut hit = false;
            for key in local.as_items() {
                if predicates::eq(&value, key, options)? {
                    hit = true;
                    break;
                }
            }
            if hit {
                matched.push(candidate.clone());
            }
        }
        set_value(&mut doc, &self.as_field, Value::Array(matched));
        Ok(doc)
    }
}

fn count_field(spec: &Value) -> Result<String> {
    match spec {
        Value::String(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('.') => Ok(s.clone()),
        _ => Err(Error::InvalidPipeline(
            "$count requires a non-empty field name without '$' or '.'".into(),
        )),
    }
}

fn non_negative(stage: &str, spec: &Value, allow_zero: bool) -> Result<usize> {
    let n = spec.as_i64().filter(|n| *n > 0 || (allow_zero && *n == 0));
    n.and_then(|n| usize::try_from(n).ok()).ok_or_else(|| {
        Error::InvalidPipeline(format!(
            "{stage} requires a {} integer",
            if allow_zero { "non-negative" } else { "positive" }
        ))
    })
}

fn field_expressions(stage: &str, spec: &Value, options: &Options) -> Result<Vec<(String, Expression)>> {
    let obj = spec
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} must be an object")))?;
    obj.iter()
        .map(|(k, v)| Ok((k.clone(), Expression::parse(v, &options.context)?)))
        .collect()
}

fn unset_fields(spec: &Value) -> Result<Vec<String>> {
    let fields: Option<Vec<String>> = match spec {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items.iter().map(|v| v.as_str().map(str::to_string)).collect(),
        _ => None,
    };
    match fields {
        Some(fields) if !fields.is_empty() => Ok(fields),
        _ => Err(Error::InvalidPipeline(
            "$unset takes a field name or an array of field names".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

enum Stage {
    Match(Query),
    Project(Projection),
    AddFields(Vec<(String, Expression)>),
    Unset(Vec<String>),
    Group(GroupSpec),
    Sort(SortSpec),
    Skip(usize),
    Limit(usize),
    Count(String),
    Unwind(UnwindSpec),
    Lookup(LookupSpec),
    ReplaceRoot(Expression),
    SortByCount(GroupSpec),
    SetWindowFields(WindowFieldsSpec),
}

impl Stage {
    fn parse(name: &str, body: &Value, options: &Options) -> Result<Stage> {
        let stage = match name {
            "$match" => Stage::Match(Query::new(body, options)?),
            "$project" => Stage::Project(Projection::parse(body, options, true)?),
            "$addFields" | "$set" => Stage::AddFields(field_expressions(name, body, options)?),
            "$unset" => Stage::Unset(unset_fields(body)?),
            "$group" => Stage::Group(GroupSpec::parse(body, options)?),
            "$sort" => Stage::Sort(parse_sort_spec(body)?),
            "$skip" => Stage::Skip(non_negative(name, body, true)?),
            "$limit" => Stage::Limit(non_negative(name, body, false)?),
            "$count" => Stage::Count(count_field(body)?),
            "$unwind" => Stage::Unwind(UnwindSpec::parse(body)?),
            "$lookup" => Stage::Lookup(LookupSpec::parse(body)?),
            "$replaceRoot" => {
                let new_root = body.get("newRoot").ok_or_else(|| {
                    Error::InvalidPipeline("$replaceRoot requires 'newRoot'".into())
                })?;
                Stage::ReplaceRoot(Expression::parse(new_root, &options.context)?)
            }
            "$replaceWith" => Stage::ReplaceRoot(Expression::parse(body, &options.context)?),
            "$sortByCount" => {
                let mut spec = Document::with_capacity(2);
                spec.insert(options.id_key.clone(), body.clone());
                spec.insert("count".into(), Value::from(serde_json::json!({"$sum": 1})));
                Stage::SortByCount(GroupSpec::parse(&Value::Object(spec), options)?)
            }
            "$setWindowFields" => Stage::SetWindowFields(WindowFieldsSpec::parse(body, options)?),
            other => {
                return Err(Error::InvalidPipeline(format!("unknown stage: {other}")));
            }
        };
        Ok(stage)
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unset(_) => "$unset",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Count(_) => "$count",
            Stage::Unwind(_) => "$unwind",
            Stage::Lookup(_) => "$lookup",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::SortByCount(_) => "$sortByCount",
            Stage::SetWindowFields(_) => "$setWindowFields",
        }
    }
}

pub struct Pipeline {
    stages: Vec<Stage>,
    options: Options,
}

impl Pipeline {
    /// Compile a pipeline. Every stage is validated here, so a bad stage
    /// fails before any document flows.
    pub fn parse(pipeline: &Value, options: Options) -> Result<Self> {
        let arr = pipeline
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut stages = Vec::with_capacity(arr.len());
        for stage_val in arr {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            let (name, body) = match obj.first() {
                Some(entry) if obj.len() == 1 => entry,
                _ => {
                    return Err(Error::InvalidPipeline(
                        "each pipeline stage must have exactly one key".into(),
                    ))
                }
            };
            stages.push(Stage::parse(name, body, &options)?);
        }
        debug!(stages = stages.len(), "compiled pipeline");

        Ok(Pipeline { stages, options })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Attach every stage to `input`. Nothing runs until the result is pulled.
    pub fn stream<'a>(&'a self, input: Lazy<'a>) -> Lazy<'a> {
        self.stages.iter().fold(input, |docs, stage| {
            trace!(stage = stage.name(), "attaching stage");
            self.attach(stage, docs)
        })
    }

    /// Run the pipeline over `docs` and collect the output.
    pub fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.stream(Lazy::from_vec(docs)).value()
    }

    fn attach<'a>(&'a self, stage: &'a Stage, docs: Lazy<'a>) -> Lazy<'a> {
        let options = &self.options;
        match stage {
            Stage::Match(query) => query.filter(docs),
            Stage::Project(projection) => docs.map(move |doc| projection.apply(&doc, options)),
            Stage::AddFields(fields) => docs.map(move |mut doc| {
                let env = Env::new(options, &doc);
                let values = fields
                    .iter()
                    .map(|(_, expr)| expr.evaluate(&doc, &env))
                    .collect::<Result<Vec<_>>>()?;
                for ((name, _), value) in fields.iter().zip(values) {
                    if value.is_missing() {
                        remove_value(&mut doc, name);
                    } else {
                        set_value(&mut doc, name, value);
                    }
                }
                Ok(doc)
            }),
            Stage::Unset(fields) => docs.map(move |mut doc| {
                for field in fields {
                    remove_value(&mut doc, field);
                }
                Ok(doc)
            }),
            Stage::Group(group) => docs.transform(move |all| group.run(all, options)),
            Stage::Sort(spec) => docs.transform(move |mut all| {
                sort_documents(&mut all, spec, options);
                Ok(all)
            }),
            Stage::Skip(n) => docs.drop(*n),
            Stage::Limit(n) => docs.take(*n),
            Stage::Count(field) => docs.transform(move |all| {
                if all.is_empty() {
                    return Ok(all);
                }
                let mut out = Document::with_capacity(1);
                out.insert(field.clone(), Value::from(all.len()));
                Ok(vec![Value::Object(out)])
            }),
            Stage::Unwind(spec) => docs.flat_map(move |doc| Ok(Lazy::from_vec(spec.apply(doc)))),
            Stage::Lookup(spec) => {
                let mut foreign: Option<Vec<Value>> = None;
                docs.map(move |doc| {
                    if foreign.is_none() {
                        foreign = Some(spec.foreign(options)?);
                    }
                    spec.join(doc, foreign.as_deref().unwrap_or_default(), options)
                })
            }
            Stage::ReplaceRoot(expr) => docs.map(move |doc| {
                match expr.evaluate(&doc, &Env::new(options, &doc))? {
                    root @ Value::Object(_) => Ok(root),
                    _ => Err(Error::NotAnObject),
                }
            }),
            Stage::SortByCount(group) => docs.transform(move |all| {
                let mut grouped = group.run(all, options)?;
                let by_count = vec![("count".to_string(), SortOrder::Desc)];
                sort_documents(&mut grouped, &by_count, options);
                Ok(grouped)
            }),
            Stage::SetWindowFields(spec) => docs.transform(move |all| spec.run(all, options)),
        }
    }
}

/// Parse `pipeline` and run it over `collection` in one step.
pub fn aggregate(collection: Vec<Value>, pipeline: &Value, options: &Options) -> Result<Vec<Value>> {
    Pipeline::parse(pipeline, options.clone())?.execute(collection)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    fn docs(items: serde_json::Value) -> Vec<Value> {
        match v(items) {
            Value::Array(items) => items,
            _ => unreachable!(),
        }
    }

    fn run(pipeline: serde_json::Value, input: serde_json::Value) -> Vec<Value> {
        aggregate(docs(input), &v(pipeline), &Options::default()).unwrap()
    }

    fn run_err(pipeline: serde_json::Value) -> Error {
        match Pipeline::parse(&v(pipeline), Options::default()) {
            Ok(_) => panic!("pipeline should not compile"),
            Err(e) => e,
        }
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_empty_pipeline() {
        let p = Pipeline::parse(&v(json!([])), Options::default()).unwrap();
        assert!(p.stages.is_empty());
        assert!(p.execute(docs(json!([{"a": 1}]))).unwrap().len() == 1);
    }

    #[test]
    fn parse_unknown_stage_errors() {
        assert!(matches!(run_err(json!([{"$unknown": {}}])), Error::InvalidPipeline(_)));
    }

    #[test]
    fn parse_invalid_accumulator_errors() {
        assert!(matches!(
            run_err(json!([{"$group": {"_id": null, "x": {"$badacc": "$v"}}}])),
            Error::UnknownOperator { .. }
        ));
    }

    #[test]
    fn parse_missing_group_id_errors() {
        run_err(json!([{"$group": {"total": {"$sum": "$v"}}}]));
    }

    #[test]
    fn parse_pipeline_not_array_errors() {
        run_err(json!({"$match": {}}));
    }

    #[test]
    fn parse_stage_not_object_errors() {
        run_err(json!(["not an object"]));
    }

    #[test]
    fn parse_stage_multiple_keys_errors() {
        run_err(json!([{"$match": {}, "$sort": {"a": 1}}]));
    }

    #[test]
    fn parse_bad_limits() {
        run_err(json!([{"$limit": 0}]));
        run_err(json!([{"$skip": -1}]));
        run_err(json!([{"$count": "$n"}]));
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    #[test]
    fn match_filters_docs() {
        let out = run(
            json!([{"$match": {"qty": {"$gte": 10}}}]),
            json!([{"qty": 5}, {"qty": 10}, {"qty": 20}]),
        );
        assert_eq!(out, docs(json!([{"qty": 10}, {"qty": 20}])));
    }

    #[test]
    fn skip_and_limit() {
        let out = run(
            json!([{"$skip": 1}, {"$limit": 2}]),
            json!([{"i": 0}, {"i": 1}, {"i": 2}, {"i": 3}]),
        );
        assert_eq!(out, docs(json!([{"i": 1}, {"i": 2}])));
        assert!(run(json!([{"$skip": 10}]), json!([{"i": 0}])).is_empty());
    }

    #[test]
    fn project_include() {
        let out = run(
            json!([{"$project": {"name": 1, "addr.city": 1}}]),
            json!([{"_id": 1, "name": "x", "age": 3, "addr": {"city": "Oslo", "zip": "0150"}}]),
        );
        assert_eq!(out, docs(json!([{"_id": 1, "name": "x", "addr": {"city": "Oslo"}}])));
    }

    #[test]
    fn project_exclude_id() {
        let out = run(
            json!([{"$project": {"_id": 0, "name": 1}}]),
            json!([{"_id": 1, "name": "x", "age": 3}]),
        );
        assert_eq!(out, docs(json!([{"name": "x"}])));
        let out = run(json!([{"$project": {"_id": 0}}]), json!([{"_id": 1, "name": "x"}]));
        assert_eq!(out, docs(json!([{"name": "x"}])));
    }

    #[test]
    fn project_exclude() {
        let out = run(
            json!([{"$project": {"age": 0, "addr": {"zip": 0}}}]),
            json!([{"_id": 1, "name": "x", "age": 3, "addr": {"city": "Oslo", "zip": "0150"}}]),
        );
        assert_eq!(out, docs(json!([{"_id": 1, "name": "x", "addr": {"city": "Oslo"}}])));
    }

    #[test]
    fn project_computed_and_nested() {
        let out = run(
            json!([{"$project": {
                "total": {"$add": ["$a", "$b"]},
                "items": {"sku": 1},
                "gone": "$$REMOVE"
            }}]),
            json!([{"_id": 7, "a": 1, "b": 2, "items": [{"sku": "s1", "qty": 1}, {"sku": "s2", "qty": 2}]}]),
        );
        assert_eq!(
            out,
            docs(json!([{"_id": 7, "total": 3, "items": [{"sku": "s1"}, {"sku": "s2"}]}]))
        );
    }

    #[test]
    fn project_mixing_is_an_error() {
        run_err(json!([{"$project": {"a": 1, "b": 0}}]));
        run_err(json!([{"$project": {}}]));
    }

    #[test]
    fn project_respects_custom_id_key() {
        let opts = Options::default().with_id_key("key");
        let out = aggregate(
            docs(json!([{"key": "k1", "_id": 1, "v": 2}])),
            &v(json!([{"$project": {"v": 1}}])),
            &opts,
        )
        .unwrap();
        assert_eq!(out, docs(json!([{"key": "k1", "v": 2}])));
    }

    #[test]
    fn add_fields_and_set() {
        let out = run(
            json!([
                {"$addFields": {"total": {"$add": ["$a", "$b"]}, "meta.source": "import"}},
                {"$set": {"a": "$$REMOVE"}}
            ]),
            json!([{"a": 1, "b": 2}]),
        );
        assert_eq!(out, docs(json!([{"b": 2, "total": 3, "meta": {"source": "import"}}])));
    }

    #[test]
    fn unset_fields() {
        let out = run(
            json!([{"$unset": ["a", "c.d"]}]),
            json!([{"a": 1, "b": 2, "c": {"d": 1, "e": 2}}]),
        );
        assert_eq!(out, docs(json!([{"b": 2, "c": {"e": 2}}])));
        assert_eq!(run(json!([{"$unset": "b"}]), json!([{"a": 1, "b": 2}])), docs(json!([{"a": 1}])));
    }

    #[test]
    fn group_then_sort() {
        let out = run(
            json!([
                {"$match": {"status": "completed"}},
                {"$group": {"_id": "$category", "total": {"$sum": "$amount"}}},
                {"$sort": {"total": -1}},
                {"$limit": 2}
            ]),
            json!([
                {"status": "completed", "category": "A", "amount": 100},
                {"status": "pending", "category": "A", "amount": 50},
                {"status": "completed", "category": "B", "amount": 200},
                {"status": "completed", "category": "A", "amount": 150},
                {"status": "completed", "category": "C", "amount": 50}
            ]),
        );
        assert_eq!(out, docs(json!([{"_id": "A", "total": 250}, {"_id": "B", "total": 200}])));
    }

    #[test]
    fn count_produces_single_doc() {
        let out = run(json!([{"$count": "n"}]), json!([{}, {}, {}]));
        assert_eq!(out, docs(json!([{"n": 3}])));
    }

    #[test]
    fn count_empty_input() {
        assert!(run(json!([{"$count": "n"}]), json!([])).is_empty());
    }

    #[test]
    fn unwind_array() {
        let out = run(
            json!([{"$unwind": "$tags"}]),
            json!([{"_id": 1, "tags": ["a", "b"]}, {"_id": 2, "tags": []}, {"_id": 3}, {"_id": 4, "tags": "solo"}]),
        );
        assert_eq!(
            out,
            docs(json!([{"_id": 1, "tags": "a"}, {"_id": 1, "tags": "b"}, {"_id": 4, "tags": "solo"}]))
        );
    }

    #[test]
    fn unwind_preserve_and_index() {
        let out = run(
            json!([{"$unwind": {"path": "$tags", "includeArrayIndex": "i", "preserveNullAndEmptyArrays": true}}]),
            json!([{"_id": 1, "tags": ["a", "b"]}, {"_id": 2, "tags": []}, {"_id": 3, "tags": null}, {"_id": 4}]),
        );
        assert_eq!(
            out,
            docs(json!([
                {"_id": 1, "tags": "a", "i": 0},
                {"_id": 1, "tags": "b", "i": 1},
                {"_id": 2, "tags": null, "i": null},
                {"_id": 3, "tags": null, "i": null},
                {"_id": 4, "i": null}
            ]))
        );
    }

    #[test]
    fn unwind_requires_dollar_path() {
        run_err(json!([{"$unwind": "tags"}]));
    }

    #[test]
    fn lookup_inline_and_resolver() {
        let inventory = json!([
            {"sku": "almonds", "instock": 120},
            {"sku": "pecans", "instock": 70},
            {"sku": null, "description": "empty"}
        ]);
        let orders = json!([{"item": "almonds"}, {"item": "bread"}, {"_id": 3}]);

        let out = run(
            json!([{"$lookup": {"from": inventory.clone(), "localField": "item", "foreignField": "sku", "as": "docs"}}]),
            orders.clone(),
        );
        assert_eq!(out[0].get("docs"), Some(&v(json!([{"sku": "almonds", "instock": 120}]))));
        assert_eq!(out[1].get("docs"), Some(&v(json!([]))));
        assert_eq!(out[2].get("docs"), Some(&v(json!([{"sku": null, "description": "empty"}]))));

        let resolved = docs(inventory);
        let opts = Options::default()
            .with_collection_resolver(move |name| (name == "inventory").then(|| resolved.clone()));
        let out = aggregate(
            docs(orders),
            &v(json!([{"$lookup": {"from": "inventory", "localField": "item", "foreignField": "sku", "as": "docs"}}])),
            &opts,
        )
        .unwrap();
        assert_eq!(out[0].get("docs").map(|d| d.as_items().len()), Some(1));

        let err = aggregate(
            docs(json!([{"item": "x"}])),
            &v(json!([{"$lookup": {"from": "nowhere", "localField": "item", "foreignField": "sku", "as": "docs"}}])),
            &opts,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn lookup_matches_array_local_field() {
        let out = run(
            json!([{"$lookup": {
                "from": [{"code": "a"}, {"code": "b"}, {"code": "c"}],
                "localField": "codes", "foreignField": "code", "as": "found"
            }}]),
            json!([{"codes": ["a", "c"]}]),
        );
        assert_eq!(out[0].get("found"), Some(&v(json!([{"code": "a"}, {"code": "c"}]))));
    }

    #[test]
    fn replace_root_and_replace_with() {
        let input = json!([{"name": {"first": "Ada", "last": "L"}}]);
        let out = run(json!([{"$replaceRoot": {"newRoot": "$name"}}]), input.clone());
        assert_eq!(out, docs(json!([{"first": "Ada", "last": "L"}])));
        let out = run(
            json!([{"$replaceWith": {"$mergeObjects": ["$name", {"full": true}]}}]),
            input.clone(),
        );
        assert_eq!(out, docs(json!([{"first": "Ada", "last": "L", "full": true}])));

        let err = aggregate(docs(input), &v(json!([{"$replaceWith": "$nope"}])), &Options::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotAnObject));
    }

    #[test]
    fn sort_by_count() {
        let out = run(
            json!([{"$unwind": "$tags"}, {"$sortByCount": "$tags"}]),
            json!([{"tags": ["a", "b"]}, {"tags": ["b"]}, {"tags": ["c", "b", "a"]}]),
        );
        assert_eq!(
            out,
            docs(json!([{"_id": "b", "count": 3}, {"_id": "a", "count": 2}, {"_id": "c", "count": 1}]))
        );
    }

    #[test]
    fn set_window_fields_stage() {
        let out = run(
            json!([{"$setWindowFields": {
                "sortBy": {"x": 1},
                "output": {"s": {"$sum": "$x", "window": {"documents": [-1, 0]}}}
            }}]),
            json!([{"x": 1}, {"x": 2}, {"x": 3}]),
        );
        assert_eq!(out, docs(json!([{"x": 1, "s": 1}, {"x": 2, "s": 3}, {"x": 3, "s": 5}])));
    }

    // -----------------------------------------------------------------------
    // Laziness and errors
    // -----------------------------------------------------------------------

    #[test]
    fn stream_pulls_only_what_limit_needs() {
        use std::cell::Cell;

        let pulled = Cell::new(0);
        let pipeline = Pipeline::parse(&v(json!([{"$match": {"keep": true}}, {"$limit": 2}])), Options::default()).unwrap();
        let source = Lazy::new((0..100).map(|i| {
            pulled.set(pulled.get() + 1);
            Ok(v(json!({"i": i, "keep": true})))
        }));
        let out = pipeline.stream(source).value().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(pulled.get(), 2);
    }

    #[test]
    fn evaluation_errors_abort_the_run() {
        let err = aggregate(
            docs(json!([{"a": 1}, {"a": 0}])),
            &v(json!([{"$project": {"r": {"$divide": [1, "$a"]}}}])),
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Evaluation { .. }));
    }
}
