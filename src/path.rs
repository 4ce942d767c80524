//! Dotted field-path access over nested documents.
//!
//! A text segment applied to an array maps the rest of the path over every
//! element and flattens the mapped results one level, so `a.b` on
//! `{a: [{b: 1}, {b: 2}]}` resolves to `[1, 2]`. Numeric segments index.

use tracing::debug;

use crate::value::{Document, Value};

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Splice results produced by nested array traversals into the outer list.
    pub flatten: bool,
    /// Report an array traversal that matched nothing as missing.
    pub missing_if_empty: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            flatten: true,
            missing_if_empty: false,
        }
    }
}

impl ResolveOptions {
    /// Resolution mode used by query predicates.
    pub fn query() -> Self {
        Self {
            flatten: true,
            missing_if_empty: true,
        }
    }
}

/// Stored values vs. lists assembled by mapping over an array.
enum Resolved {
    Plain(Value),
    Mapped(Vec<Value>),
}

/// Resolve `path` against `doc`. `None` means the field is missing.
pub fn resolve(doc: &Value, path: &str) -> Option<Value> {
    resolve_with(doc, path, ResolveOptions::default())
}

pub fn resolve_with(doc: &Value, path: &str, opts: ResolveOptions) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    match walk(doc, &parts, false, opts)? {
        Resolved::Plain(v) => Some(v),
        Resolved::Mapped(items) if items.is_empty() && opts.missing_if_empty => None,
        Resolved::Mapped(items) => Some(Value::Array(items)),
    }
}

fn walk(value: &Value, parts: &[&str], nested: bool, opts: ResolveOptions) -> Option<Resolved> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(Resolved::Plain(value.clone()));
    };
    match value {
        Value::Object(map) => walk(map.get(*head)?, rest, false, opts),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return walk(items.get(index)?, rest, false, opts);
            }
            // arrays directly inside arrays are not traversed by text segments
            if nested {
                return None;
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match walk(item, parts, true, opts) {
                    Some(Resolved::Plain(v)) => out.push(v),
                    Some(Resolved::Mapped(vs)) if opts.flatten => out.extend(vs),
                    Some(Resolved::Mapped(vs)) => out.push(Value::Array(vs)),
                    None => {}
                }
            }
            Some(Resolved::Mapped(out))
        }
        _ => None,
    }
}

/// Set `value` at `path`, creating intermediate documents as needed.
///
/// A text segment over an array applies to every document element; a
/// numeric segment targets one index, padding with nulls when setting past
/// the end. An index more than [`MAX_NULL_PADDING`] past the end is not
/// written.
pub fn set_value(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    set_parts(doc, &parts, value);
}

/// Largest run of nulls `set_value` will insert to reach an array index.
pub const MAX_NULL_PADDING: usize = 1 << 16;

fn set_parts(target: &mut Value, parts: &[&str], value: Value) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    match target {
        Value::Object(map) => {
            if rest.is_empty() {
                map.insert(head.to_string(), value);
                return;
            }
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() && !child.is_array() {
                *child = Value::Object(Document::new());
            }
            set_parts(child, rest, value);
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if rest.is_empty() {
                    if index.saturating_sub(items.len()) > MAX_NULL_PADDING {
                        debug!(index, len = items.len(), "array index too far past the end, not set");
                        return;
                    }
                    while items.len() < index {
                        items.push(Value::Null);
                    }
                    if index == items.len() {
                        items.push(value);
                    } else {
                        items[index] = value;
                    }
                } else if let Some(child) = items.get_mut(index) {
                    set_parts(child, rest, value);
                }
                return;
            }
            for item in items.iter_mut().filter(|item| item.is_object()) {
                set_parts(item, parts, value.clone());
            }
        }
        _ => {}
    }
}

/// Remove the leaf at `path`. Ancestors are left in place, even if empty.
pub fn remove_value(doc: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    remove_parts(doc, &parts);
}

fn remove_parts(target: &mut Value, parts: &[&str]) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    match target {
        Value::Object(map) => {
            if rest.is_empty() {
                map.shift_remove(*head);
            } else if let Some(child) = map.get_mut(*head) {
                remove_parts(child, rest);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if rest.is_empty() {
                    if index < items.len() {
                        items[index] = Value::Null;
                    }
                } else if let Some(child) = items.get_mut(index) {
                    remove_parts(child, rest);
                }
                return;
            }
            for item in items.iter_mut() {
                remove_parts(item, parts);
            }
        }
        _ => {}
    }
}
