//! Mailbox tasks: `csp.Chan`, `csp.Send` and `csp.Recv`.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use taskflow_types::Msg;
use tracing::debug;

use super::{decode_params, is_unset, missing_field};
use crate::context::ExecutionContext;
use crate::error::FlowError;
use crate::registry::Runner;

/// Creates (or replaces) a named mailbox. `buf` defaults to 0, a rendezvous channel.
pub struct ChanTask;

#[derive(Debug, Deserialize)]
struct ChanParams {
    #[serde(default)]
    mailbox: Option<String>,
    #[serde(default)]
    buf: Option<usize>,
}

#[async_trait]
impl Runner for ChanTask {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let params: ChanParams = decode_params(ctx)?;
        let Some(name) = params.mailbox else {
            return Err(missing_field(ctx, "csp.Chan", "mailbox").into());
        };
        let capacity = params.buf.unwrap_or(0);
        ctx.create_mailbox(&name, capacity);
        debug!(mailbox = %name, capacity, "created mailbox");
        Ok(None)
    }
}

/// Sends `{key, val}` to a mailbox, blocking until there is room (or a receiver, for
/// rendezvous mailboxes).
pub struct SendTask;

#[derive(Debug, Deserialize)]
struct SendParams {
    #[serde(default)]
    mailbox: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

#[async_trait]
impl Runner for SendTask {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let params: SendParams = decode_params(ctx)?;
        let val = ctx.value().get("val");
        if is_unset(val) {
            return Err(missing_field(ctx, "csp.Send", "val").into());
        }
        let val = val.cloned().unwrap_or(Value::Null);
        let Some(name) = params.mailbox else {
            return Err(missing_field(ctx, "csp.Send", "mailbox").into());
        };

        let mailbox = ctx.mailbox(&name)?;
        let msg = Msg { key: params.key, val };
        tokio::select! {
            sent = mailbox.send(msg) => sent?,
            _ = ctx.cancel_token().cancelled() => return Err(FlowError::Cancelled.into()),
        }
        debug!(mailbox = %name, "sent message");
        Ok(None)
    }
}

/// Receives one message and fills it into the node as `msg: {key, val}`.
///
/// An optional `timeout` (`"5s"`, `"2m"`, or seconds) bounds the wait.
pub struct RecvTask;

#[derive(Debug, Deserialize)]
struct RecvParams {
    #[serde(default)]
    mailbox: Option<String>,
    #[serde(default)]
    timeout: Option<Value>,
}

#[async_trait]
impl Runner for RecvTask {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let params: RecvParams = decode_params(ctx)?;
        let Some(name) = params.mailbox else {
            return Err(missing_field(ctx, "csp.Recv", "mailbox").into());
        };
        let timeout = match &params.timeout {
            None | Some(Value::Null) => None,
            Some(raw) => match parse_timeout(raw) {
                Some(timeout) => Some(timeout),
                None => bail!("invalid timeout {raw} for csp.Recv on mailbox {name:?}"),
            },
        };

        let mailbox = ctx.mailbox(&name)?;
        let receive = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, mailbox.recv())
                    .await
                    .map_err(|_| FlowError::ChannelTimeout(name.clone()))?,
                None => mailbox.recv().await,
            }
        };
        let msg = tokio::select! {
            received = receive => received?,
            _ = ctx.cancel_token().cancelled() => return Err(FlowError::Cancelled.into()),
        };
        debug!(mailbox = %name, key = ?msg.key, "received message");
        Ok(Some(json!({ "msg": msg })))
    }
}

/// Parses `"30s"`, `"2m"`, bare seconds, or a JSON number of seconds.
fn parse_timeout(raw: &Value) -> Option<Duration> {
    match raw {
        Value::Number(seconds) => seconds.as_f64().filter(|seconds| *seconds >= 0.0).map(Duration::from_secs_f64),
        Value::String(text) => parse_interval(text),
        _ => None,
    }
}

fn parse_interval(raw_interval: &str) -> Option<Duration> {
    let trimmed = raw_interval.trim();
    if let Some(millis) = trimmed.strip_suffix("ms") {
        return millis.parse().ok().map(Duration::from_millis);
    }
    let last_character = trimmed.chars().last()?;
    if last_character.is_ascii_alphabetic() {
        let value: u64 = trimmed[..trimmed.len() - 1].parse().ok()?;
        return match last_character {
            's' | 'S' => Some(Duration::from_secs(value)),
            'm' | 'M' => Some(Duration::from_secs(value * 60)),
            _ => None,
        };
    }
    trimmed.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timeouts() {
        assert_eq!(parse_timeout(&json!("5s")), Some(Duration::from_secs(5)));
        assert_eq!(parse_timeout(&json!("2m")), Some(Duration::from_secs(120)));
        assert_eq!(parse_timeout(&json!("250ms")), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout(&json!("7")), Some(Duration::from_secs(7)));
        assert_eq!(parse_timeout(&json!(1.5)), Some(Duration::from_millis(1500)));
        assert_eq!(parse_timeout(&json!("soon")), None);
        assert_eq!(parse_timeout(&json!(true)), None);
    }
}
