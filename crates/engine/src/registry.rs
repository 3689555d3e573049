//! Task-type registry and the middleware chain wrapped around every constructor.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::context::ExecutionContext;

/// A constructed task, ready to run against a task-local context.
///
/// `ctx.value()` holds the node value with injected inputs. Returning
/// `Ok(Some(value))` merges `value` into the node; `Ok(None)` leaves it as is.
/// To report a failure and still merge what was produced, return a
/// [`crate::task::PartialResult`] error.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>>;
}

/// Builds a runner from a node value.
pub type Constructor = Arc<dyn Fn(&Value) -> Result<Box<dyn Runner>> + Send + Sync>;

/// Wraps a constructor. Implementations usually inspect the node value and
/// either return `next` unchanged or a constructor producing a wrapping runner.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ctx: &ExecutionContext, next: Constructor) -> Constructor;
}

/// Convenience for building a [`Constructor`] from a closure.
pub fn constructor<F>(build: F) -> Constructor
where
    F: Fn(&Value) -> Result<Box<dyn Runner>> + Send + Sync + 'static,
{
    Arc::new(build)
}

#[derive(Default)]
pub(crate) struct Registry {
    constructors: RwLock<HashMap<String, Constructor>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Registry {
    pub(crate) fn register(&self, task_type: &str, constructor: Constructor) {
        let replaced = self
            .constructors
            .write()
            .expect("registry lock")
            .insert(task_type.to_string(), constructor)
            .is_some();
        debug!(task_type, replaced, "registered task type");
    }

    pub(crate) fn lookup(&self, task_type: &str) -> Option<Constructor> {
        self.constructors.read().expect("registry lock").get(task_type).cloned()
    }

    pub(crate) fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().expect("registry lock").keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = middleware.name(), "added middleware");
        self.middlewares.write().expect("middleware lock").push(middleware);
    }

    /// Applies the chain in reverse registration order, so the first middleware
    /// added ends up outermost.
    pub(crate) fn wrap(&self, ctx: &ExecutionContext, constructor: Constructor) -> Constructor {
        let middlewares = self.middlewares.read().expect("middleware lock").clone();
        middlewares
            .iter()
            .rev()
            .fold(constructor, |next, middleware| middleware.apply(ctx, next))
    }
}
