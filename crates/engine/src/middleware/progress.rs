use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::registry::{Constructor, Middleware, Runner, constructor};

/// Logs task start and completion with elapsed time.
pub struct ProgressMiddleware;

impl Middleware for ProgressMiddleware {
    fn name(&self) -> &str {
        "progress"
    }

    fn apply(&self, _ctx: &ExecutionContext, next: Constructor) -> Constructor {
        constructor(move |value| {
            let inner = next(value)?;
            Ok(Box::new(ProgressRunner { inner }))
        })
    }
}

struct ProgressRunner {
    inner: Box<dyn Runner>,
}

#[async_trait]
impl Runner for ProgressRunner {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let task = ctx.task().map(|task| task.id().to_string()).unwrap_or_default();
        let depth = ctx.flow_stack().len();
        let started = Instant::now();
        info!(task = %task, depth, "task started");

        let result = self.inner.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(task = %task, elapsed_ms, "task finished"),
            Err(error) => warn!(task = %task, elapsed_ms, error = %error, "task errored"),
        }
        result
    }
}
