//! Bridges graph-engine nodes to registered task implementations.
//!
//! [`TaskAdapter`] is the [`TaskFactory`] every flow hands to its engine. For
//! each task node it resolves and wraps the registered constructor, creates the
//! bookkeeping record, and returns an [`AdaptedTask`] that performs injection,
//! runs the task with timing events, merges its result into the document, and
//! publishes declared outputs.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use taskflow_types::{NodeMeta, TASK_MARKER};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::document;
use crate::error::FlowError;
use crate::graph::{GraphNode, GraphTask, TaskFactory, TaskRunnable};
use crate::registry::Runner;
use crate::task::{FILL_BEGIN, FILL_END, PartialResult, RUN_BEGIN, RUN_END, TaskRecord};

pub struct TaskAdapter {
    ctx: ExecutionContext,
}

impl TaskAdapter {
    /// `ctx` is the flow's context; every task gets its own view derived from it.
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }
}

impl TaskFactory for TaskAdapter {
    fn make(&self, node: &GraphNode<'_>) -> Result<Option<Arc<dyn TaskRunnable>>> {
        if node.is_root() {
            return Ok(None);
        }
        let Some(task_type) = node.value.get(TASK_MARKER).and_then(Value::as_str) else {
            return Ok(None);
        };

        let constructor = self.ctx.lookup(task_type).ok_or_else(|| FlowError::UnknownTask {
            task_type: task_type.to_string(),
            path: node.path.to_string(),
        })?;
        let constructor = self.ctx.wrap_constructor(constructor);
        let runner = constructor(node.value).with_context(|| format!("failed to construct {task_type} task at {}", node.path))?;
        let record = self.ctx.task_record(&node.path, task_type, node.value);
        debug!(task = %node.path, task_type, "adapted task node");

        Ok(Some(Arc::new(AdaptedTask {
            ctx: self.ctx.derive(),
            runner,
            record,
        })))
    }
}

pub struct AdaptedTask {
    ctx: ExecutionContext,
    runner: Box<dyn Runner>,
    record: Arc<TaskRecord>,
}

#[async_trait]
impl TaskRunnable for AdaptedTask {
    async fn run(&self, task: &GraphTask) -> Result<()> {
        let mut ctx = self.ctx.derive();
        ctx.set_task(Arc::clone(&self.record));
        let evaluator = ctx.evaluator().clone();

        let mut value = task.value();
        let meta = match evaluator.decode_meta(&value) {
            Ok(meta) => meta,
            Err(error) => return Err(self.fail(&mut ctx, error, None)),
        };
        let injected = evaluator
            .inject(&mut value, &meta, ctx.globals())
            .map_err(anyhow::Error::from)
            .context("error injecting variables");
        match injected {
            Ok(0) => {}
            Ok(_) => {
                if let Err(conflict) = evaluator.fill_task(task, &value) {
                    return Err(self.fail(&mut ctx, conflict.into(), None));
                }
            }
            Err(error) => return Err(self.fail(&mut ctx, error, None)),
        }
        self.record.set_start(value.clone());
        ctx.set_value(value);

        self.record.record_event(RUN_BEGIN);
        let outcome = self.runner.run(&mut ctx).await;
        self.record.record_event(RUN_END);

        let (produced, mut failure) = match outcome {
            Ok(produced) => (produced, None),
            Err(error) => match error.downcast::<PartialResult>() {
                Ok(partial) => (Some(partial.value), Some(partial.error)),
                Err(error) => (None, Some(error)),
            },
        };

        if let Some(produced) = &produced {
            self.record.record_event(FILL_BEGIN);
            let filled = evaluator.fill_task(task, produced);
            self.record.record_event(FILL_END);
            if let Err(conflict) = filled
                && failure.is_none()
            {
                failure = Some(conflict.into());
            }
        }

        let final_value = task.value();
        self.record.set_final(final_value.clone());

        if let Some(error) = failure {
            return Err(self.fail(&mut ctx, error, produced.as_ref()));
        }

        self.publish_outputs(&ctx, &meta, &final_value);
        Ok(())
    }
}

impl AdaptedTask {
    /// Annotates a task error with its path and partial value, and records it.
    fn fail(&self, ctx: &mut ExecutionContext, error: anyhow::Error, partial: Option<&Value>) -> anyhow::Error {
        let partial = partial
            .and_then(|value| serde_json::to_string_pretty(value).ok())
            .unwrap_or_else(|| "<no value>".to_string());
        let wrapped = anyhow!("in {:?}\n{:#}\n{}", self.record.id(), error, partial);
        warn!(task = %self.record.id(), error = %format!("{error:#}"), "task failed");
        self.record.set_error(format!("{error:#}"));
        ctx.set_error(&wrapped);
        ctx.add_error(&wrapped);
        wrapped
    }

    fn publish_outputs(&self, ctx: &ExecutionContext, meta: &NodeMeta, final_value: &Value) {
        for output in &meta.outputs {
            let segments = output.source_segments();
            match document::lookup_segments(final_value, &segments) {
                Some(value) => ctx.globals().publish_output(self.record.id(), output.name(), value.clone()),
                None => ctx.add_warning(format!(
                    "task {} declares output {} but its value has no field {}",
                    self.record.id(),
                    output.name(),
                    segments.join(".")
                )),
            }
        }
    }
}
