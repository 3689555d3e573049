//! Boundary to the dependency-graph engine.
//!
//! The execution core never infers dependencies itself. A [`GraphEngine`] builds a
//! [`Controller`] over a document; the controller offers every candidate node to a
//! [`TaskFactory`], orders the accepted tasks, and releases each one to its
//! [`TaskRunnable`] only after everything it depends on has completed.
//! [`DependencyEngine`] is the engine used unless the context is built with another.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::document::{self, DocPath};
use crate::error::FlowError;

mod dependency;

pub use dependency::DependencyEngine;

/// Options a flow passes when building a controller.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Release tasks even when references in their value are still unresolved.
    pub ignore_concrete: bool,
    /// Also look for tasks under `_`-prefixed fields.
    pub find_hidden_tasks: bool,
    /// Absolute path of the document root; task paths are reported relative to the
    /// outermost document by prefixing it.
    pub root: DocPath,
    /// Maximum number of tasks running at once. `None` is unbounded.
    pub parallelism: Option<usize>,
}

/// A node offered to a [`TaskFactory`] during discovery.
#[derive(Debug)]
pub struct GraphNode<'a> {
    /// Absolute path (engine root prefixed).
    pub path: DocPath,
    /// Path relative to the controller's document.
    pub local_path: DocPath,
    pub value: &'a Value,
}

impl GraphNode<'_> {
    pub fn is_root(&self) -> bool {
        self.local_path.is_root()
    }
}

/// Decides whether a node is a task and, if so, how to run it.
pub trait TaskFactory: Send + Sync {
    fn make(&self, node: &GraphNode<'_>) -> Result<Option<Arc<dyn TaskRunnable>>>;
}

#[async_trait]
pub trait TaskRunnable: Send + Sync {
    async fn run(&self, task: &GraphTask) -> Result<()>;
}

/// Handle to a released task and the document it lives in.
#[derive(Debug, Clone)]
pub struct GraphTask {
    path: DocPath,
    local_path: DocPath,
    index: usize,
    dependencies: Vec<DocPath>,
    doc: Arc<Mutex<Value>>,
}

impl GraphTask {
    pub(crate) fn new(path: DocPath, local_path: DocPath, index: usize, dependencies: Vec<DocPath>, doc: Arc<Mutex<Value>>) -> Self {
        Self {
            path,
            local_path,
            index,
            dependencies,
            doc,
        }
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    pub fn local_path(&self) -> &DocPath {
        &self.local_path
    }

    /// Discovery order of the task.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Absolute paths of the tasks this one waited for.
    pub fn dependencies(&self) -> &[DocPath] {
        &self.dependencies
    }

    /// Current value of the task node.
    pub fn value(&self) -> Value {
        let doc = self.doc.lock().expect("document lock");
        document::lookup(&doc, &self.local_path).cloned().unwrap_or(Value::Null)
    }

    /// Unifies `incoming` into the task node.
    pub fn fill(&self, incoming: &Value) -> Result<(), FlowError> {
        let mut doc = self.doc.lock().expect("document lock");
        document::unify_at(&mut doc, &self.local_path, incoming)
    }
}

/// Static description of a discovered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub path: DocPath,
    pub dependencies: Vec<DocPath>,
}

/// Failure of a single task, tagged with its absolute path.
#[derive(Debug, Error)]
#[error("task {path} failed")]
pub struct TaskFailure {
    pub path: DocPath,
    #[source]
    pub source: anyhow::Error,
}

#[async_trait]
pub trait Controller: Send {
    /// Runs every task to completion, stopping after the first failure.
    async fn run(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Current document, including everything merged so far.
    fn value(&self) -> Value;

    /// Discovered tasks in discovery order.
    fn tasks(&self) -> Vec<TaskInfo>;
}

pub trait GraphEngine: Send + Sync {
    fn controller(&self, config: EngineConfig, doc: Value, factory: Arc<dyn TaskFactory>) -> Result<Box<dyn Controller>>;
}
