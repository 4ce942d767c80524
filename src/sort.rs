use std::cmp::Ordering;

use crate::context::{Collation, Options};
use crate::error::{Error, Result};
use crate::path::resolve;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Ordered `(field, direction)` pairs.
pub type SortSpec = Vec<(String, SortOrder)>;

/// Parse a sort specification: an object of field -> 1 (asc) or -1 (desc).
pub fn parse_sort_spec(spec: &Value) -> Result<SortSpec> {
    let obj = spec
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("sort specification must be an object".into()))?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline("sort specification is empty".into()));
    }
    let mut fields = Vec::with_capacity(obj.len());
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidPipeline(
                    "sort direction must be 1 (asc) or -1 (desc)".into(),
                ))
            }
        };
        fields.push((field.clone(), order));
    }
    Ok(fields)
}

/// Compare two values, folding string case when the collation asks for it.
pub fn compare_with_collation(a: &Value, b: &Value, collation: Option<&Collation>) -> Ordering {
    match (a, b, collation) {
        (Value::String(x), Value::String(y), Some(c)) if c.case_insensitive() => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        _ => a.compare(b),
    }
}

/// Key a document sorts by for one field. Missing sorts as null; an array
/// sorts by its smallest element ascending and its largest descending.
fn sort_key(doc: &Value, field: &str, order: SortOrder) -> Value {
    match resolve(doc, field) {
        None => Value::Null,
        Some(Value::Array(items)) if !items.is_empty() => {
            let pick = match order {
                SortOrder::Asc => items.into_iter().min(),
                SortOrder::Desc => items.into_iter().max(),
            };
            pick.unwrap_or(Value::Null)
        }
        Some(v) => v,
    }
}

/// Compare two documents under `spec`.
pub fn compare_documents(a: &Value, b: &Value, spec: &SortSpec, options: &Options) -> Ordering {
    for (field, order) in spec {
        let ka = sort_key(a, field, *order);
        let kb = sort_key(b, field, *order);
        let cmp = compare_with_collation(&ka, &kb, options.collation.as_ref());
        let cmp = match order {
            SortOrder::Asc => cmp,
            SortOrder::Desc => cmp.reverse(),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Stable in-place sort; documents with equal keys keep their input order.
pub fn sort_documents(docs: &mut [Value], spec: &SortSpec, options: &Options) {
    docs.sort_by(|a, b| compare_documents(a, b, spec, options));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(items: serde_json::Value) -> Vec<Value> {
        match Value::from(items) {
            Value::Array(items) => items,
            _ => unreachable!(),
        }
    }

    fn names(docs: &[Value]) -> Vec<String> {
        docs.iter()
            .map(|d| d.get("name").and_then(Value::as_str).unwrap_or("-").to_string())
            .collect()
    }

    #[test]
    fn parse_directions() {
        let spec = parse_sort_spec(&Value::from(json!({"a": 1, "b": -1}))).unwrap();
        assert_eq!(spec, vec![("a".to_string(), SortOrder::Asc), ("b".to_string(), SortOrder::Desc)]);
        assert!(parse_sort_spec(&Value::from(json!({"a": 2}))).is_err());
        assert!(parse_sort_spec(&Value::from(json!({}))).is_err());
    }

    #[test]
    fn multi_key_and_stability() {
        let mut input = docs(json!([
            {"name": "a", "g": 2, "n": 1},
            {"name": "b", "g": 1, "n": 5},
            {"name": "c", "g": 2, "n": 1},
            {"name": "d", "g": 1, "n": 9}
        ]));
        let spec = parse_sort_spec(&Value::from(json!({"g": 1, "n": -1}))).unwrap();
        sort_documents(&mut input, &spec, &Options::default());
        assert_eq!(names(&input), ["d", "b", "a", "c"]);
    }

    #[test]
    fn missing_sorts_first_ascending() {
        let mut input = docs(json!([{"name": "x", "v": 3}, {"name": "y"}, {"name": "z", "v": null}]));
        let spec = parse_sort_spec(&Value::from(json!({"v": 1}))).unwrap();
        sort_documents(&mut input, &spec, &Options::default());
        assert_eq!(names(&input), ["y", "z", "x"]);
    }

    #[test]
    fn array_keys_use_min_or_max() {
        let mut input = docs(json!([{"name": "p", "v": [1, 10]}, {"name": "q", "v": [5]}]));
        let asc = parse_sort_spec(&Value::from(json!({"v": 1}))).unwrap();
        sort_documents(&mut input, &asc, &Options::default());
        assert_eq!(names(&input), ["p", "q"]);
        let desc = parse_sort_spec(&Value::from(json!({"v": -1}))).unwrap();
        sort_documents(&mut input, &desc, &Options::default());
        assert_eq!(names(&input), ["p", "q"]);
    }

    #[test]
    fn collation_folds_case() {
        let mut input = docs(json!([{"name": "B"}, {"name": "a"}]));
        let spec = parse_sort_spec(&Value::from(json!({"name": 1}))).unwrap();
        sort_documents(&mut input, &spec, &Options::default());
        assert_eq!(names(&input), ["B", "a"]);
        let opts = Options::default().with_collation(Collation::new("en").with_strength(2));
        sort_documents(&mut input, &spec, &opts);
        assert_eq!(names(&input), ["a", "B"]);
    }
}
