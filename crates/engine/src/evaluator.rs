//! Guarded access to document evaluation.
//!
//! Every decode, lookup, merge, and injection performed on behalf of a task goes
//! through one run-wide [`Evaluator`], which serialises those operations. Task
//! logic itself never runs under the guard.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use taskflow_types::{InputPaths, NodeMeta, TASK_MARKER, parse_inject_marker};

use crate::document::{self, DocPath};
use crate::error::FlowError;
use crate::graph::GraphTask;
use crate::vars::GlobalVars;

#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    lock: Arc<Mutex<()>>,
}

impl Evaluator {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("evaluator lock")
    }

    pub fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T> {
        let _guard = self.guard();
        serde_json::from_value(value.clone()).context("failed to decode task value")
    }

    pub fn decode_meta(&self, value: &Value) -> Result<NodeMeta> {
        let _guard = self.guard();
        NodeMeta::from_value(value).context("failed to decode task metadata")
    }

    pub fn lookup(&self, value: &Value, path: &DocPath) -> Option<Value> {
        let _guard = self.guard();
        document::lookup(value, path).cloned()
    }

    /// Unifies `incoming` into `base`, returning the merged value.
    pub fn fill(&self, base: &Value, incoming: &Value) -> Result<Value, FlowError> {
        let _guard = self.guard();
        document::unify(base, incoming)
    }

    /// Unifies `incoming` into the node at `path` of `root`.
    pub fn fill_path(&self, root: &mut Value, path: &DocPath, incoming: &Value) -> Result<(), FlowError> {
        let _guard = self.guard();
        document::unify_at(root, path, incoming)
    }

    /// Merges a task result into the task's node of the running document.
    pub fn fill_task(&self, task: &GraphTask, incoming: &Value) -> Result<(), FlowError> {
        let _guard = self.guard();
        task.fill(incoming)
    }

    /// Replaces every `@runinject(alias)` string in `value` with the variable(s) the
    /// node's `inputs` entry for `alias` points at. Returns the number of replacements.
    ///
    /// Nested task objects are left alone; their markers belong to their own inputs.
    pub fn inject(&self, value: &mut Value, meta: &NodeMeta, vars: &GlobalVars) -> Result<usize, FlowError> {
        let _guard = self.guard();
        inject_markers(value, true, meta, vars)
    }
}

fn inject_markers(value: &mut Value, top: bool, meta: &NodeMeta, vars: &GlobalVars) -> Result<usize, FlowError> {
    match value {
        Value::String(text) => {
            let Some(alias) = parse_inject_marker(text).map(str::to_string) else {
                return Ok(0);
            };
            *value = resolve_input(&alias, meta, vars)?;
            Ok(1)
        }
        Value::Array(items) => {
            let mut injected = 0;
            for item in items {
                injected += inject_markers(item, false, meta, vars)?;
            }
            Ok(injected)
        }
        Value::Object(map) if top || !map.contains_key(TASK_MARKER) => {
            let mut injected = 0;
            for (key, item) in map.iter_mut() {
                if key == "inputs" || key.starts_with('@') {
                    continue;
                }
                injected += inject_markers(item, false, meta, vars)?;
            }
            Ok(injected)
        }
        _ => Ok(0),
    }
}

fn resolve_input(alias: &str, meta: &NodeMeta, vars: &GlobalVars) -> Result<Value, FlowError> {
    let input = meta.input(alias).ok_or_else(|| FlowError::UndeclaredInput(alias.to_string()))?;
    let resolve_one = |path: &str| {
        vars.lookup(path).ok_or_else(|| FlowError::UnresolvedInput {
            alias: alias.to_string(),
            path: path.to_string(),
        })
    };
    match &input.value {
        InputPaths::One(path) => resolve_one(path),
        InputPaths::Many(paths) => paths.iter().map(|path| resolve_one(path)).collect::<Result<Vec<_>, _>>().map(Value::Array),
    }
}
