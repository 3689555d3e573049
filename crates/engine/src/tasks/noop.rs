use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::registry::Runner;

/// Does nothing. Useful as an ordering anchor and for declaring outputs of literal values.
pub struct NoopTask;

#[async_trait]
impl Runner for NoopTask {
    async fn run(&self, _ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        Ok(None)
    }
}
