//! `${{ path }}` reference parsing and substitution.
//!
//! A string consisting of exactly one reference is replaced by the raw JSON
//! value it resolves to; references embedded in longer strings are replaced by
//! the value's text form.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use taskflow_types::TASK_MARKER;

static WHOLE_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\$\{\{\s*([^{}]+?)\s*\}\}\s*$").expect("whole template regex should compile"));

/// Structured unresolved template reference diagnostic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnresolvedTemplateRef {
    /// Source path where the template was found, relative to the substituted value.
    pub source_path: String,
    /// Raw template expression without delimiters.
    pub expression: String,
}

/// Extracts template expressions from a string value.
///
/// Returned expressions do not include `${{` or `}}` delimiters.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find("${{") {
        let after_start = &remainder[start + 3..];
        let Some(end) = after_start.find("}}") else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            expressions.push(expression.to_string());
        }
        remainder = &after_start[end + 2..];
    }

    expressions
}

/// Returns the expression when `value` is exactly one `${{ .. }}` reference.
pub fn whole_template_expression(value: &str) -> Option<&str> {
    WHOLE_TEMPLATE.captures(value).and_then(|captures| captures.get(1)).map(|capture| capture.as_str())
}

pub fn is_whole_template(value: &str) -> bool {
    WHOLE_TEMPLATE.is_match(value)
}

/// Collects every template expression found in a value tree.
///
/// Nested objects carrying their own task marker are skipped: their references
/// belong to the nested flow that will run them.
pub fn collect_template_expressions(value: &Value) -> Vec<String> {
    let mut expressions = Vec::new();
    collect_into(value, true, &mut expressions);
    expressions
}

fn collect_into(value: &Value, top: bool, expressions: &mut Vec<String>) {
    match value {
        Value::String(text) => expressions.extend(extract_template_expressions(text)),
        Value::Array(items) => items.iter().for_each(|item| collect_into(item, false, expressions)),
        Value::Object(map) if top || !map.contains_key(TASK_MARKER) => map
            .iter()
            .filter(|(key, _)| !key.starts_with('@'))
            .for_each(|(_, item)| collect_into(item, false, expressions)),
        _ => {}
    }
}

/// Replaces resolvable references in place and returns the ones that did not resolve.
///
/// Unresolved references are left untouched so the value stays a placeholder. Like
/// [`collect_template_expressions`], nested task objects are not entered.
pub fn substitute_templates<F>(value: &mut Value, resolve: &F) -> Vec<UnresolvedTemplateRef>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut unresolved = Vec::new();
    substitute_inner(value, "", resolve, &mut unresolved);
    unresolved
}

fn substitute_inner<F>(value: &mut Value, source_path: &str, resolve: &F, unresolved: &mut Vec<UnresolvedTemplateRef>)
where
    F: Fn(&str) -> Option<Value>,
{
    match value {
        Value::String(text) => {
            if let Some(expression) = whole_template_expression(text).map(str::to_string) {
                match resolve(&expression) {
                    Some(resolved) => *value = resolved,
                    None => unresolved.push(UnresolvedTemplateRef {
                        source_path: source_path.to_string(),
                        expression,
                    }),
                }
                return;
            }
            if text.contains("${{") {
                *text = interpolate_string(text, source_path, resolve, unresolved);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                substitute_inner(item, &child_path(source_path, &index.to_string()), resolve, unresolved);
            }
        }
        Value::Object(map) => {
            if !source_path.is_empty() && map.contains_key(TASK_MARKER) {
                return;
            }
            for (key, item) in map.iter_mut() {
                if key.starts_with('@') {
                    continue;
                }
                substitute_inner(item, &child_path(source_path, key), resolve, unresolved);
            }
        }
        _ => {}
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() { segment.to_string() } else { format!("{parent}.{segment}") }
}

fn interpolate_string<F>(input: &str, source_path: &str, resolve: &F, unresolved: &mut Vec<UnresolvedTemplateRef>) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    let mut output = String::new();
    let mut remaining = input;

    while let Some(start) = remaining.find("${{") {
        let (before, after) = remaining.split_at(start);
        output.push_str(before);

        let Some(end) = after.find("}}") else {
            // Unterminated reference, keep the rest verbatim.
            output.push_str(after);
            return output;
        };
        let raw = &after[..end + 2];
        let expression = after[3..end].trim();
        match resolve(expression) {
            Some(resolved) => output.push_str(&format_json_value(&resolved)),
            None => {
                unresolved.push(UnresolvedTemplateRef {
                    source_path: source_path.to_string(),
                    expression: expression.to_string(),
                });
                output.push_str(raw);
            }
        }
        remaining = &after[end + 2..];
    }

    output.push_str(remaining);
    output
}

/// Text form used when a value is spliced into a longer string.
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}
