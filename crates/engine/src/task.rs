//! Per-task bookkeeping records and the partial-result error.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::document::DocPath;

pub const RUN_BEGIN: &str = "run.beg";
pub const RUN_END: &str = "run.end";
pub const FILL_BEGIN: &str = "fill.beg";
pub const FILL_END: &str = "fill.end";

/// A task failure that still produced a value worth merging into the document.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct PartialResult {
    pub value: Value,
    pub error: anyhow::Error,
}

impl PartialResult {
    pub fn new(value: Value, error: anyhow::Error) -> Self {
        Self { value, error }
    }
}

/// Mutable part of a [`TaskRecord`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskState {
    /// Node value after injection, as handed to the runner.
    pub start: Option<Value>,
    /// Node value after the result was merged.
    #[serde(rename = "final")]
    pub final_value: Option<Value>,
    pub error: Option<String>,
    pub time_events: IndexMap<String, DateTime<Utc>>,
}

/// Bookkeeping for one task node, created on first visit and kept for the whole run.
#[derive(Debug)]
pub struct TaskRecord {
    id: String,
    uuid: Uuid,
    path: DocPath,
    task_type: String,
    orig: Value,
    state: Mutex<TaskState>,
}

impl TaskRecord {
    pub fn new(path: DocPath, task_type: impl Into<String>, orig: Value) -> Self {
        Self {
            id: path.to_string(),
            uuid: Uuid::new_v4(),
            path,
            task_type: task_type.into(),
            orig,
            state: Mutex::new(TaskState::default()),
        }
    }

    /// Path-derived identifier, used in `tasks.<id>.outputs.<name>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn orig(&self) -> &Value {
        &self.orig
    }

    pub fn record_event(&self, name: &str) {
        self.state.lock().expect("task record lock").time_events.insert(name.to_string(), Utc::now());
    }

    pub fn set_start(&self, value: Value) {
        self.state.lock().expect("task record lock").start = Some(value);
    }

    pub fn set_final(&self, value: Value) {
        self.state.lock().expect("task record lock").final_value = Some(value);
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.state.lock().expect("task record lock").error = Some(error.into());
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().expect("task record lock").clone()
    }

    pub fn event(&self, name: &str) -> Option<DateTime<Utc>> {
        self.state.lock().expect("task record lock").time_events.get(name).copied()
    }

    /// Time between `run.beg` and `run.end`, when both were recorded.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        let state = self.state.lock().expect("task record lock");
        let begin = state.time_events.get(RUN_BEGIN)?;
        let end = state.time_events.get(RUN_END)?;
        Some(*end - *begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_events_in_order_and_measures_run_duration() {
        let record = TaskRecord::new(DocPath::parse("tasks.a"), "noop", json!({"@task": "noop"}));
        assert_eq!(record.id(), "tasks.a");
        assert!(record.run_duration().is_none());

        record.record_event(RUN_BEGIN);
        record.record_event(RUN_END);
        record.record_event(FILL_BEGIN);
        record.record_event(FILL_END);

        let state = record.state();
        let names: Vec<&str> = state.time_events.keys().map(String::as_str).collect();
        assert_eq!(names, vec![RUN_BEGIN, RUN_END, FILL_BEGIN, FILL_END]);
        assert!(record.run_duration().expect("duration") >= chrono::Duration::zero());
    }

    #[test]
    fn partial_result_displays_underlying_error() {
        let partial = PartialResult::new(json!({"done": 1}), anyhow::anyhow!("half way"));
        assert_eq!(partial.to_string(), "half way");
    }
}
