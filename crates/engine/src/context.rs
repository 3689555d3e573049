//! Run-scoped execution context.
//!
//! One [`ExecutionContext`] is built per top-level run. Tasks receive a view of
//! it produced by [`ExecutionContext::derive`]: every shared collection (registry,
//! bookkeeping table, mailboxes, scratch store, global variables, diagnostics)
//! is reached through the same `Arc`, while the current value, error, and task
//! record are reset and the flow call stack is copied.

use std::{
    collections::HashMap,
    io::{self, Write},
    sync::{Arc, Mutex, RwLock},
};

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;
use taskflow_types::RunModes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::document::DocPath;
use crate::error::FlowError;
use crate::evaluator::Evaluator;
use crate::graph::{DependencyEngine, GraphEngine};
use crate::mailbox::Mailbox;
use crate::registry::{Constructor, Middleware, Registry};
use crate::store::ScratchStore;
use crate::task::TaskRecord;
use crate::vars::GlobalVars;

/// Output handle shared by all tasks of a run.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

struct Shared {
    registry: Registry,
    tasks: Mutex<IndexMap<DocPath, Arc<TaskRecord>>>,
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    store: ScratchStore,
    globals: GlobalVars,
    evaluator: Evaluator,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    stdout: SharedWriter,
    stderr: SharedWriter,
    modes: RunModes,
    cancel: CancellationToken,
    engine: Arc<dyn GraphEngine>,
}

pub struct ExecutionContext {
    shared: Arc<Shared>,
    flow_stack: Vec<DocPath>,
    value: Value,
    error: Option<String>,
    task: Option<Arc<TaskRecord>>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("flow_stack", &self.flow_stack)
            .field("task", &self.task.as_ref().map(|task| task.id().to_string()))
            .field("modes", &self.shared.modes)
            .finish_non_exhaustive()
    }
}

/// Builds the root [`ExecutionContext`] of a run.
pub struct ContextBuilder {
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    modes: RunModes,
    cancel: Option<CancellationToken>,
    engine: Option<Arc<dyn GraphEngine>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            stdout: None,
            stderr: None,
            modes: RunModes::default(),
            cancel: None,
            engine: None,
        }
    }

    pub fn stdout(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    pub fn stderr(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    pub fn modes(mut self, modes: RunModes) -> Self {
        self.modes = modes;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn GraphEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> ExecutionContext {
        let shared = Shared {
            registry: Registry::default(),
            tasks: Mutex::new(IndexMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            store: ScratchStore::default(),
            globals: GlobalVars::default(),
            evaluator: Evaluator::default(),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            stdout: Arc::new(Mutex::new(self.stdout.unwrap_or_else(|| Box::new(io::stdout())))),
            stderr: Arc::new(Mutex::new(self.stderr.unwrap_or_else(|| Box::new(io::stderr())))),
            modes: self.modes,
            cancel: self.cancel.unwrap_or_default(),
            engine: self.engine.unwrap_or_else(|| Arc::new(DependencyEngine)),
        };
        ExecutionContext {
            shared: Arc::new(shared),
            flow_stack: Vec::new(),
            value: Value::Null,
            error: None,
            task: None,
        }
    }
}

impl ExecutionContext {
    /// Task-local view sharing all run-wide state with `self`.
    pub fn derive(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            flow_stack: self.flow_stack.clone(),
            value: Value::Null,
            error: None,
            task: None,
        }
    }

    pub fn register(&self, task_type: &str, constructor: Constructor) {
        self.shared.registry.register(task_type, constructor);
    }

    pub fn lookup(&self, task_type: &str) -> Option<Constructor> {
        self.shared.registry.lookup(task_type)
    }

    /// Registered task type identifiers, sorted.
    pub fn task_types(&self) -> Vec<String> {
        self.shared.registry.task_types()
    }

    /// Appends a middleware; the first one added wraps all later ones.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.shared.registry.use_middleware(middleware);
    }

    pub fn wrap_constructor(&self, constructor: Constructor) -> Constructor {
        self.shared.registry.wrap(self, constructor)
    }

    pub fn add_error(&self, error: &anyhow::Error) {
        self.shared.errors.lock().expect("errors lock").push(format!("{error:#}"));
    }

    pub fn add_warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "task warning");
        self.shared.warnings.lock().expect("warnings lock").push(message);
    }

    pub fn errors(&self) -> Vec<String> {
        self.shared.errors.lock().expect("errors lock").clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.shared.warnings.lock().expect("warnings lock").clone()
    }

    /// Returns the record for `path`, creating it on first visit.
    pub fn task_record(&self, path: &DocPath, task_type: &str, orig: &Value) -> Arc<TaskRecord> {
        let mut tasks = self.shared.tasks.lock().expect("task table lock");
        Arc::clone(
            tasks
                .entry(path.clone())
                .or_insert_with(|| Arc::new(TaskRecord::new(path.clone(), task_type, orig.clone()))),
        )
    }

    pub fn find_task(&self, path: &DocPath) -> Option<Arc<TaskRecord>> {
        self.shared.tasks.lock().expect("task table lock").get(path).cloned()
    }

    /// All records in first-visit order.
    pub fn tasks(&self) -> Vec<Arc<TaskRecord>> {
        self.shared.tasks.lock().expect("task table lock").values().cloned().collect()
    }

    /// Creates the named mailbox, replacing any existing one of that name.
    pub fn create_mailbox(&self, name: &str, capacity: usize) -> Arc<Mailbox> {
        let mailbox = Mailbox::new(name, capacity);
        let previous = self
            .shared
            .mailboxes
            .write()
            .expect("mailbox lock")
            .insert(name.to_string(), Arc::clone(&mailbox));
        if previous.is_some() {
            debug!(mailbox = name, capacity, "replaced existing mailbox");
        }
        mailbox
    }

    pub fn mailbox(&self, name: &str) -> Result<Arc<Mailbox>, FlowError> {
        self.shared
            .mailboxes
            .read()
            .expect("mailbox lock")
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::ChannelNotFound(name.to_string()))
    }

    pub fn store(&self) -> &ScratchStore {
        &self.shared.store
    }

    pub fn globals(&self) -> &GlobalVars {
        &self.shared.globals
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.shared.evaluator
    }

    pub fn modes(&self) -> RunModes {
        self.shared.modes
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub fn engine(&self) -> Arc<dyn GraphEngine> {
        Arc::clone(&self.shared.engine)
    }

    pub fn stdout(&self) -> SharedWriter {
        Arc::clone(&self.shared.stdout)
    }

    pub fn stderr(&self) -> SharedWriter {
        Arc::clone(&self.shared.stderr)
    }

    /// Writes one line to the run's stdout.
    pub fn print_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.shared.stdout.lock().expect("stdout lock");
        writeln!(out, "{line}")?;
        out.flush()
    }

    /// Writes one line to the run's stderr.
    pub fn eprint_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.shared.stderr.lock().expect("stderr lock");
        writeln!(out, "{line}")?;
        out.flush()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: &anyhow::Error) {
        self.error = Some(format!("{error:#}"));
    }

    pub fn task(&self) -> Option<&Arc<TaskRecord>> {
        self.task.as_ref()
    }

    pub fn set_task(&mut self, task: Arc<TaskRecord>) {
        self.task = Some(task);
    }

    /// Paths of the nested flows enclosing this context, outermost first.
    pub fn flow_stack(&self) -> &[DocPath] {
        &self.flow_stack
    }

    pub fn push_flow(&mut self, path: DocPath) {
        self.flow_stack.push(path);
    }

    pub fn pop_flow(&mut self) -> Option<DocPath> {
        self.flow_stack.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_shares_state_and_resets_locals() {
        let mut root = ContextBuilder::new().build();
        root.set_value(json!({"a": 1}));
        root.push_flow(DocPath::parse("outer"));

        let mut child = root.derive();
        assert_eq!(child.value(), &Value::Null);
        assert!(child.task().is_none());
        assert_eq!(child.flow_stack(), &[DocPath::parse("outer")]);

        child.push_flow(DocPath::parse("inner"));
        assert_eq!(root.flow_stack().len(), 1);

        child.store().store("k", json!("v"));
        child.globals().set("tasks.a.outputs.x", json!(5));
        child.add_warning("careful");
        assert_eq!(root.store().load("k"), Some(json!("v")));
        assert_eq!(root.globals().lookup("tasks.a.outputs.x"), Some(json!(5)));
        assert_eq!(root.warnings(), vec!["careful".to_string()]);
    }

    #[test]
    fn task_records_are_created_once_per_path() {
        let ctx = ContextBuilder::new().build();
        let path = DocPath::parse("tasks.a");
        let first = ctx.task_record(&path, "noop", &json!({"v": 1}));
        let second = ctx.derive().task_record(&path, "noop", &json!({"v": 2}));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.orig(), &json!({"v": 1}));
        assert_eq!(ctx.tasks().len(), 1);
    }

    #[test]
    fn unknown_mailbox_is_reported_by_name() {
        let ctx = ContextBuilder::new().build();
        let error = ctx.mailbox("jobs").expect_err("missing mailbox");
        assert_eq!(error.to_string(), "channel \"jobs\" not found");
        ctx.create_mailbox("jobs", 1);
        assert_eq!(ctx.mailbox("jobs").expect("created").capacity(), 1);
    }
}
