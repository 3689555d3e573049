//! Runs a node's value as a nested flow.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::document::DocPath;
use crate::error::FlowError;
use crate::flow::Flow;
use crate::registry::Runner;

/// Nested flows deeper than this fail instead of recursing further.
pub const MAX_NEST_DEPTH: usize = 64;

pub struct NestTask;

#[async_trait]
impl Runner for NestTask {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let path = ctx.task().map(|task| task.path().clone()).unwrap_or_else(DocPath::root);
        if ctx.flow_stack().len() >= MAX_NEST_DEPTH {
            return Err(FlowError::NestingDepth {
                limit: MAX_NEST_DEPTH,
                path: path.to_string(),
            }
            .into());
        }

        ctx.push_flow(path.clone());
        debug!(task = %path, depth = ctx.flow_stack().len(), "entering nested flow");
        let result = run_child(ctx, path).await;
        ctx.pop_flow();

        let final_value = result.context("in nested task")?;
        Ok(Some(final_value))
    }
}

async fn run_child(ctx: &ExecutionContext, path: DocPath) -> Result<Value> {
    let mut child = Flow::new(ctx.derive(), ctx.value().clone(), path)?;
    child.start().await?;
    Ok(child.final_value().clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::context::ContextBuilder;
    use crate::task::TaskRecord;
    use crate::tasks::register_defaults;

    fn nest_context(value: Value) -> ExecutionContext {
        let root = ContextBuilder::new().build();
        register_defaults(&root);
        let mut ctx = root.derive();
        ctx.push_flow(DocPath::parse("outer"));
        let path = DocPath::parse("outer.inner");
        ctx.set_task(Arc::new(TaskRecord::new(path, "nest", value.clone())));
        ctx.set_value(value);
        ctx
    }

    #[tokio::test]
    async fn returns_the_child_final_and_restores_the_stack() {
        let value = json!({"@task": "nest", "step": {"@task": "noop", "n": 1}});
        let mut ctx = nest_context(value.clone());

        let produced = NestTask.run(&mut ctx).await.expect("nested run");
        assert_eq!(produced, Some(value));
        assert_eq!(ctx.flow_stack(), &[DocPath::parse("outer")]);
    }

    #[tokio::test]
    async fn failures_are_wrapped_and_restore_the_stack() {
        let mut ctx = nest_context(json!({"@task": "nest", "step": {"@task": "missing"}}));

        let error = NestTask.run(&mut ctx).await.expect_err("nested failure");
        assert!(format!("{error:#}").starts_with("in nested task: "));
        assert_eq!(ctx.flow_stack(), &[DocPath::parse("outer")]);
    }

    #[tokio::test]
    async fn depth_is_limited() {
        let mut ctx = nest_context(json!({"@task": "nest"}));
        for depth in 0..MAX_NEST_DEPTH {
            ctx.push_flow(DocPath::parse(&format!("level{depth}")));
        }

        let error = NestTask.run(&mut ctx).await.expect_err("too deep");
        assert!(matches!(error.downcast_ref::<FlowError>(), Some(FlowError::NestingDepth { .. })));
    }
}
