//! Document model helpers over `serde_json::Value`.
//!
//! A workflow document is a tree of JSON objects. Nodes are addressed by a
//! [`DocPath`], and task results are merged back into the tree with [`unify`],
//! a monotonic union: placeholders may be replaced by concrete values, but two
//! different concrete values never overwrite one another.

use std::fmt;

use serde_json::{Map, Value};
use taskflow_types::parse_inject_marker;

use crate::error::FlowError;
use crate::templates::is_whole_template;

/// Dotted address of a node inside a document. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(Vec<String>);

impl DocPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parses `a.b[0].c` style paths. Bracketed indices become their own segments.
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        for part in raw.trim().split('.') {
            if part.is_empty() {
                continue;
            }
            let (key, indices) = split_indices(part);
            if !key.is_empty() {
                segments.push(key.to_string());
            }
            segments.extend(indices);
        }
        Self(segments)
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn join(&self, other: &DocPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    pub fn starts_with(&self, prefix: &DocPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn strip_prefix(&self, prefix: &DocPath) -> Option<DocPath> {
        self.0.strip_prefix(prefix.0.as_slice()).map(|rest| Self(rest.to_vec()))
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for DocPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

fn split_indices(segment: &str) -> (&str, Vec<String>) {
    let Some(bracket) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let key = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(end) = stripped.find(']') else {
            break;
        };
        let index = stripped[..end].trim();
        if !index.is_empty() {
            indices.push(index.to_string());
        }
        rest = &stripped[end + 1..];
    }
    (key, indices)
}

/// Returns the value at `path`, descending objects by key and arrays by index.
pub fn lookup<'a>(root: &'a Value, path: &DocPath) -> Option<&'a Value> {
    lookup_segments(root, path.segments())
}

pub fn lookup_segments<'a, S: AsRef<str>>(root: &'a Value, segments: &[S]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate objects.
///
/// Non-container intermediates are replaced by empty objects.
pub fn set_path(root: &mut Value, path: &DocPath, value: Value) {
    let mut current = root;
    for segment in path.segments() {
        let array_index = match &*current {
            Value::Array(items) => segment.parse::<usize>().ok().filter(|index| *index < items.len()),
            _ => None,
        };
        if array_index.is_none() && !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match (current, array_index) {
            (Value::Array(items), Some(index)) => &mut items[index],
            (Value::Object(map), _) => map.entry(segment.clone()).or_insert(Value::Null),
            _ => return,
        };
    }
    *current = value;
}

/// Values that carry no information yet and may be replaced during a merge.
///
/// Null, `@runinject(..)` markers, and strings consisting of exactly one
/// `${{ .. }}` reference are placeholders.
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => parse_inject_marker(text).is_some() || is_whole_template(text),
        _ => false,
    }
}

/// Returns true when the tree contains no placeholders.
pub fn is_concrete(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_concrete),
        Value::Object(map) => map.values().all(is_concrete),
        other => !is_placeholder(other),
    }
}

/// Merges `incoming` into `base` and returns the union.
///
/// Objects merge key by key, arrays of equal length merge element-wise, and
/// placeholders on either side yield to the other side. Anything else must be equal.
pub fn unify(base: &Value, incoming: &Value) -> Result<Value, FlowError> {
    let mut path = Vec::new();
    unify_inner(base, incoming, &mut path)
}

/// Merges `incoming` into the node at `path` of `root`. A missing node is treated as a placeholder.
pub fn unify_at(root: &mut Value, path: &DocPath, incoming: &Value) -> Result<(), FlowError> {
    let existing = lookup(root, path).cloned().unwrap_or(Value::Null);
    let mut trail = path.segments().to_vec();
    let merged = unify_inner(&existing, incoming, &mut trail)?;
    set_path(root, path, merged);
    Ok(())
}

fn unify_inner(base: &Value, incoming: &Value, path: &mut Vec<String>) -> Result<Value, FlowError> {
    if is_placeholder(incoming) && !incoming.is_null() && is_placeholder(base) {
        return Ok(if base.is_null() { incoming.clone() } else { base.clone() });
    }
    if is_placeholder(incoming) {
        return Ok(base.clone());
    }
    if is_placeholder(base) {
        return Ok(incoming.clone());
    }

    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            let mut merged = base_map.clone();
            for (key, incoming_value) in incoming_map {
                path.push(key.clone());
                let value = match base_map.get(key) {
                    Some(existing) => unify_inner(existing, incoming_value, path)?,
                    None => incoming_value.clone(),
                };
                path.pop();
                merged.insert(key.clone(), value);
            }
            Ok(Value::Object(merged))
        }
        (Value::Array(base_items), Value::Array(incoming_items)) if base_items.len() == incoming_items.len() => {
            let mut merged = Vec::with_capacity(base_items.len());
            for (index, (existing, incoming_value)) in base_items.iter().zip(incoming_items).enumerate() {
                path.push(index.to_string());
                merged.push(unify_inner(existing, incoming_value, path)?);
                path.pop();
            }
            Ok(Value::Array(merged))
        }
        (existing, incoming_value) if existing == incoming_value => Ok(existing.clone()),
        (existing, incoming_value) => Err(FlowError::Conflict {
            path: if path.is_empty() { "<root>".to_string() } else { path.join(".") },
            existing: existing.to_string(),
            incoming: incoming_value.to_string(),
        }),
    }
}
