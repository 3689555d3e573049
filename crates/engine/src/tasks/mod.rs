//! Built-in task types.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::FlowError;
use crate::registry::constructor;

pub mod csp;
pub mod kv;
pub mod nest;
pub mod noop;

pub use csp::{ChanTask, RecvTask, SendTask};
pub use kv::MemTask;
pub use nest::{MAX_NEST_DEPTH, NestTask};
pub use noop::NoopTask;

/// Registers every built-in task type on `ctx`.
pub fn register_defaults(ctx: &ExecutionContext) {
    ctx.register("noop", constructor(|_| Ok(Box::new(NoopTask))));
    ctx.register("nest", constructor(|_| Ok(Box::new(NestTask))));
    ctx.register("csp.Chan", constructor(|_| Ok(Box::new(ChanTask))));
    ctx.register("csp.Send", constructor(|_| Ok(Box::new(SendTask))));
    ctx.register("csp.Recv", constructor(|_| Ok(Box::new(RecvTask))));
    ctx.register("kv.Mem", constructor(|_| Ok(Box::new(MemTask))));
}

/// Absolute path of the running task, for error messages.
pub(crate) fn task_path(ctx: &ExecutionContext) -> String {
    ctx.task().map(|task| task.id().to_string()).unwrap_or_default()
}

pub(crate) fn missing_field(ctx: &ExecutionContext, task: &str, field: &str) -> FlowError {
    FlowError::MissingField {
        task: task.to_string(),
        path: task_path(ctx),
        field: field.to_string(),
    }
}

/// Decodes the task's current value under the evaluator guard.
pub(crate) fn decode_params<T: DeserializeOwned>(ctx: &ExecutionContext) -> Result<T> {
    ctx.evaluator().decode(ctx.value())
}

/// True when a field is absent or still a placeholder.
pub(crate) fn is_unset(value: Option<&Value>) -> bool {
    value.is_none_or(crate::document::is_placeholder)
}
