//! `kv.Mem`: the run's scratch key-value store as a task.
//!
//! With a concrete `val` the task stores it under `key` (or deletes the key when
//! `delete: true`). Without one it loads the key, optionally deleting it, and
//! fills `val` and `loaded` into the node.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{decode_params, is_unset, missing_field};
use crate::context::ExecutionContext;
use crate::registry::Runner;

pub struct MemTask;

#[derive(Debug, Deserialize)]
struct MemParams {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    delete: bool,
}

#[async_trait]
impl Runner for MemTask {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let params: MemParams = decode_params(ctx)?;
        let Some(key) = params.key else {
            return Err(missing_field(ctx, "kv.Mem", "key").into());
        };
        let val = ctx.value().get("val");

        if !is_unset(val) {
            let val = val.cloned().unwrap_or(Value::Null);
            if params.delete {
                ctx.store().delete(&key);
                debug!(key = %key, "deleted scratch entry");
            } else {
                ctx.store().store(key.as_str(), val);
                debug!(key = %key, "stored scratch entry");
            }
            return Ok(None);
        }

        let loaded = if params.delete {
            ctx.store().load_and_delete(&key)
        } else {
            ctx.store().load(&key)
        };
        debug!(key = %key, found = loaded.is_some(), delete = params.delete, "loaded scratch entry");
        Ok(Some(json!({
            "loaded": loaded.is_some(),
            "val": loaded.unwrap_or(Value::Null),
        })))
    }
}
