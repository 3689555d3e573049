//! Typed failures raised by the execution core.
//!
//! Callers mostly see these wrapped in [`anyhow::Error`]; the variants exist so
//! tests and the CLI can match on the category when they need to.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// A node names a task type nothing registered.
    #[error("unknown task: {task_type:?} at {path:?}")]
    UnknownTask { task_type: String, path: String },

    /// An injection input points at a variable that was never published.
    #[error("failed to resolve input {alias}: {path}")]
    UnresolvedInput { alias: String, path: String },

    /// A `@runinject` marker names an alias the node does not declare.
    #[error("no input declared for injection alias {0:?}")]
    UndeclaredInput(String),

    /// Two concrete values met during a merge.
    #[error("conflicting values at {path}: {existing} != {incoming}")]
    Conflict { path: String, existing: String, incoming: String },

    #[error("root flow value is not a flow, has no flow metadata")]
    NotAFlow,

    #[error("channel {0:?} not found")]
    ChannelNotFound(String),

    #[error("channel {0:?} closed")]
    ChannelClosed(String),

    #[error("timed out waiting on channel {0:?}")]
    ChannelTimeout(String),

    #[error("in {task} task {path}: missing field '{field}'")]
    MissingField { task: String, path: String, field: String },

    #[error("maximum flow nesting depth ({limit}) exceeded at {path}")]
    NestingDepth { limit: usize, path: String },

    #[error("bulk source {0} is not iterable")]
    NotIterable(String),

    #[error("bulk source {0} not found")]
    BulkSourceMissing(String),

    #[error("run cancelled")]
    Cancelled,

    /// Aggregate outcome of a bulk run. `finals` holds the labelled final
    /// documents of the jobs that succeeded.
    #[error("{failed} error(s) were encountered")]
    Aggregate { failed: usize, finals: Vec<(String, Value)> },
}
