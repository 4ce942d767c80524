use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::SecondsFormat;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Insertion-ordered document body.
pub type Document = IndexMap<String, Value>;

/// A document value with type-aware ordering.
///
/// Dates are stored as i64 millisecond timestamps so range comparisons and
/// window offsets stay integer arithmetic. `Missing` is the absent state a
/// path lookup or `$$REMOVE` produces; it is never stored inside a document.
#[derive(Debug, Clone, Default)]
pub enum Value {
    Missing,
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(i64), // millis since epoch
    Array(Vec<Value>),
    Object(Document),
}

// ---------------------------------------------------------------------------
// Ordering & equality
// ---------------------------------------------------------------------------

impl Value {
    /// Rank of the value's type in the cross-type sort order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Missing => 0,
            Value::Null => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::Bool(_) => 6,
            Value::Date(_) => 7,
        }
    }

    /// Total order used by sorting, `$min`/`$max` and range predicates.
    pub fn compare(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Float(b)) => cmp_f64(*a as f64, *b),
            (Float(a), Int(b)) => cmp_f64(*a, *b as f64),
            (Float(a), Float(b)) => cmp_f64(*a, *b),
            (String(a), String(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let cmp = x.compare(y);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Object(a), Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let cmp = ka.cmp(kb).then_with(|| va.compare(vb));
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// True when both values belong to the same comparison class
    /// (all numbers form a single class).
    pub fn same_type_class(&self, other: &Value) -> bool {
        self.type_rank() == other.type_rank()
    }
}

/// NaN sorts below every other number; -0.0 equals 0.0.
fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn hash_f64<H: Hasher>(f: f64, state: &mut H) {
    let canonical = if f == 0.0 {
        0.0
    } else if f.is_nan() {
        f64::NAN
    } else {
        f
    };
    canonical.to_bits().hash(state);
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Missing | Value::Null => {}
            Value::Bool(b) => b.hash(state),
            // Int and Float compare through f64, so they must hash through it too.
            Value::Int(i) => hash_f64(*i as f64, state),
            Value::Float(f) => hash_f64(*f, state),
            Value::String(s) => s.hash(state),
            Value::Date(ms) => ms.hash(state),
            Value::Array(items) => {
                items.len().hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Object(map) => {
                map.len().hash(state);
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null or missing.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Null | Value::Missing)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Document> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Document> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Field lookup on an object value. Does not traverse paths.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// The value's elements if it is an array, otherwise the value itself.
    pub fn as_items(&self) -> &[Value] {
        match self {
            Value::Array(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Truthiness of a value in boolean contexts.
    ///
    /// In strict mode the empty string and NaN are true, matching MongoDB.
    pub fn is_truthy(&self, strict: bool) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) if f.is_nan() => strict,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => strict || !s.is_empty(),
            _ => true,
        }
    }

    /// Type alias as reported by `$type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(i) if i32::try_from(*i).is_ok() => "int",
            Value::Int(_) => "long",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Missing collapses to null; used wherever a value must be stored.
    pub fn or_null(self) -> Value {
        match self {
            Value::Missing => Value::Null,
            other => other,
        }
    }
}

/// Integral results are folded back into `Int` so arithmetic on whole
/// numbers does not drift into floats.
pub fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

// ---------------------------------------------------------------------------
// JSON interop
// ---------------------------------------------------------------------------

const DATE_KEY: &str = "$date";

impl Value {
    /// Convert a JSON value. `{"$date": ...}` becomes a `Date`.
    pub fn from_json(json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    n.as_f64().map(Value::Float).unwrap_or(Value::Null)
                }
            }
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some(date) = map.get(DATE_KEY).and_then(date_from_json) {
                        return Value::Date(date);
                    }
                }
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Convert back to JSON. Missing and non-finite floats become null.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Missing | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(ms) => {
                let mut map = serde_json::Map::new();
                let rendered = chrono::DateTime::from_timestamp_millis(*ms)
                    .map(|dt| JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                    .unwrap_or_else(|| JsonValue::Number((*ms).into()));
                map.insert(DATE_KEY.to_string(), rendered);
                JsonValue::Object(map)
            }
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .filter(|(_, v)| !v.is_missing())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn date_from_json(json: &JsonValue) -> Option<i64> {
    match json {
        JsonValue::String(s) => parse_date(s),
        JsonValue::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Parse the date formats accepted in `$date` and `$dateFromString`.
pub fn parse_date(s: &str) -> Option<i64> {
    // Try RFC 3339 / ISO 8601 with timezone: "2024-01-15T10:30:00Z"
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // Try ISO 8601 without timezone: "2024-01-15T10:30:00"
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    // Try space-separated datetime: "2024-01-15 10:30:00"
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    // Try date only: "2024-01-15"
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        Value::from_json(json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        i64::try_from(n)
            .map(Value::Int)
            .unwrap_or(Value::Float(n as f64))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(map: Document) -> Self {
        Value::Object(map)
    }
}

impl From<Option<Value>> for Value {
    fn from(v: Option<Value>) -> Self {
        v.unwrap_or(Value::Missing)
    }
}
