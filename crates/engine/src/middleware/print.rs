//! `@print` directive handling.
//!
//! Nodes without the directive pass through untouched. Otherwise the selected
//! field (or the whole value) is written before or after the task runs.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use taskflow_types::{NodeMeta, PRINT_MARKER, PrintDirective, PrintLevel};
use tracing::info;

use crate::context::ExecutionContext;
use crate::document::{self, DocPath};
use crate::registry::{Constructor, Middleware, Runner, constructor};

pub struct PrintMiddleware;

impl Middleware for PrintMiddleware {
    fn name(&self) -> &str {
        "print"
    }

    fn apply(&self, _ctx: &ExecutionContext, next: Constructor) -> Constructor {
        constructor(move |value| {
            let inner = next(value)?;
            if value.get(PRINT_MARKER).is_none() {
                return Ok(inner);
            }
            let Some(directive) = NodeMeta::from_value(value)?.print else {
                return Ok(inner);
            };
            Ok(Box::new(PrintRunner { inner, directive }))
        })
    }
}

struct PrintRunner {
    inner: Box<dyn Runner>,
    directive: PrintDirective,
}

impl PrintRunner {
    fn emit(&self, ctx: &ExecutionContext, value: &Value) -> Result<()> {
        let selected = match self.directive.path() {
            Some(path) => document::lookup(value, &DocPath::parse(path)).cloned().unwrap_or(Value::Null),
            None => value.clone(),
        };
        let text = match &selected {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        let task = ctx.task().map(|task| task.id().to_string()).unwrap_or_default();
        match self.directive.level() {
            PrintLevel::Stdout => ctx.print_line(&text)?,
            PrintLevel::Stderr => ctx.eprint_line(&text)?,
            PrintLevel::Log => info!(task = %task, value = %text, "print"),
        }
        Ok(())
    }
}

#[async_trait]
impl Runner for PrintRunner {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        if self.directive.before() {
            self.emit(ctx, ctx.value())?;
            return self.inner.run(ctx).await;
        }

        let produced = self.inner.run(ctx).await?;
        let merged = match &produced {
            Some(produced) => ctx.evaluator().fill(ctx.value(), produced)?,
            None => ctx.value().clone(),
        };
        self.emit(ctx, &merged)?;
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::context::ContextBuilder;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("capture lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Produce(Value);

    #[async_trait]
    impl Runner for Produce {
        async fn run(&self, _ctx: &mut ExecutionContext) -> Result<Option<Value>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn prints_selected_field_after_run() {
        let stdout = Capture::default();
        let mut ctx = ContextBuilder::new().stdout(stdout.clone()).build();
        let node = json!({"@task": "t", "@print": "result.name", "result": null});
        ctx.set_value(node.clone());

        let next = constructor(|_| Ok(Box::new(Produce(json!({"result": {"name": "done"}})))));
        let runner = PrintMiddleware.apply(&ctx, next)(&node).expect("construct");
        let produced = runner.run(&mut ctx).await.expect("run");

        assert_eq!(produced, Some(json!({"result": {"name": "done"}})));
        assert_eq!(String::from_utf8(stdout.0.lock().expect("capture lock").clone()).expect("utf8"), "done\n");
    }

    #[tokio::test]
    async fn nodes_without_directive_pass_through() {
        let stdout = Capture::default();
        let mut ctx = ContextBuilder::new().stdout(stdout.clone()).build();
        let node = json!({"@task": "t"});
        ctx.set_value(node.clone());

        let next = constructor(|_| Ok(Box::new(Produce(json!({"x": 1})))));
        let runner = PrintMiddleware.apply(&ctx, next)(&node).expect("construct");
        runner.run(&mut ctx).await.expect("run");
        assert!(stdout.0.lock().expect("capture lock").is_empty());
    }
}
