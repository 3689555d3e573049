use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use taskflow_engine::document::DocPath;
use taskflow_engine::{ContextBuilder, ExecutionContext, Flow, FlowError, Runner, constructor, default_context};
use taskflow_types::RunModes;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().expect("capture lock").clone()).expect("utf8 output")
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Produces the node's `emit` field as its result.
struct Emit(Value);

#[async_trait]
impl Runner for Emit {
    async fn run(&self, _ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        Ok(Some(self.0.clone()))
    }
}

struct Harness {
    stdout: Capture,
    stderr: Capture,
}

impl Harness {
    fn new() -> Self {
        Self {
            stdout: Capture::default(),
            stderr: Capture::default(),
        }
    }

    fn context(&self, modes: RunModes) -> ExecutionContext {
        let ctx = default_context(
            ContextBuilder::new()
                .stdout(self.stdout.clone())
                .stderr(self.stderr.clone())
                .modes(modes),
        );
        ctx.register(
            "emit",
            constructor(|node| Ok(Box::new(Emit(node.get("emit").cloned().unwrap_or(Value::Null))))),
        );
        ctx
    }

    async fn run(&self, doc: Value) -> (Flow, Result<()>) {
        let mut flow = Flow::new(self.context(RunModes::default()), doc, DocPath::root()).expect("flow");
        let outcome = flow.start().await;
        (flow, outcome)
    }
}

#[tokio::test]
async fn outputs_are_injected_into_dependent_tasks() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "demo",
            "consumer": {
                "@task": "noop",
                "inputs": [{"alias": "x", "value": "tasks.producer.outputs.x"}],
                "got": "@runinject(x)",
            },
            "producer": {"@task": "emit", "emit": {"x": 5}, "outputs": ["x"], "x": null},
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["producer"]["x"], json!(5));
    assert_eq!(flow.final_value()["consumer"]["got"], json!(5));
    assert_eq!(flow.context().globals().lookup("tasks.producer.outputs.x"), Some(json!(5)));

    let consumer = flow.tasks().iter().find(|task| task.path == DocPath::parse("consumer")).expect("consumer");
    assert_eq!(consumer.dependencies, vec![DocPath::parse("producer")]);
}

#[tokio::test]
async fn references_are_substituted_after_the_referenced_task_runs() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "greet",
            "shout": {"@task": "noop", "message": "${{ name.value }} world", "copy": "${{ name.value }}"},
            "name": {"@task": "emit", "emit": {"value": "hello"}, "value": null},
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["shout"]["message"], json!("hello world"));
    assert_eq!(flow.final_value()["shout"]["copy"], json!("hello"));

    let name = flow.context().find_task(&DocPath::parse("name")).expect("record");
    let shout = flow.context().find_task(&DocPath::parse("shout")).expect("record");
    assert!(name.event("run.end").expect("name ran") <= shout.event("run.beg").expect("shout ran"));
}

#[tokio::test]
async fn unknown_task_types_fail_the_flow() {
    let harness = Harness::new();
    let (_, outcome) = harness.run(json!({"@flow": "bad", "step": {"@task": "nope"}})).await;

    let error = outcome.expect_err("unknown task");
    let message = format!("{error:#}");
    assert!(message.starts_with("Error in bad"), "{message}");
    assert!(message.contains(r#"unknown task: "nope" at "step""#), "{message}");
}

#[test]
fn values_without_markers_are_not_flows() {
    let ctx = ContextBuilder::new().build();
    let error = Flow::new(ctx, json!({"a": 1}), DocPath::root()).err().expect("not a flow");
    assert!(matches!(error, FlowError::NotAFlow));
}

#[tokio::test]
async fn nested_flows_merge_their_final_value() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "outer",
            "inner": {
                "@task": "nest",
                "leaf": {"@task": "emit", "emit": {"v": 1}, "v": null},
            },
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["inner"]["leaf"]["v"], json!(1));
    assert!(flow.context().find_task(&DocPath::parse("inner.leaf")).is_some());
    assert!(flow.context().flow_stack().is_empty());
}

#[tokio::test]
async fn nested_tasks_inject_from_their_own_siblings() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "outer",
            "inner": {
                "@task": "nest",
                "producer": {"@task": "emit", "emit": {"x": 5}, "outputs": ["x"], "x": null},
                "consumer": {
                    "@task": "noop",
                    "@after": ["producer"],
                    "inputs": [{"alias": "x", "value": "tasks.inner.producer.outputs.x"}],
                    "got": "@runinject(x)",
                },
            },
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["inner"]["consumer"]["got"], json!(5));
}

#[tokio::test]
async fn nested_tasks_wait_for_outer_producers() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "outer",
            "inner": {
                "@task": "nest",
                "consumer": {
                    "@task": "noop",
                    "inputs": [{"alias": "x", "value": "tasks.producer.outputs.x"}],
                    "got": "@runinject(x)",
                },
            },
            "producer": {"@task": "emit", "emit": {"x": 7}, "outputs": ["x"], "x": null},
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["inner"]["consumer"]["got"], json!(7));
    let inner = flow.tasks().iter().find(|task| task.path == DocPath::parse("inner")).expect("inner");
    assert_eq!(inner.dependencies, vec![DocPath::parse("producer")]);
}

#[tokio::test]
async fn nested_failures_are_reported_once_by_the_outer_flow() {
    let harness = Harness::new();
    let (_, outcome) = harness
        .run(json!({
            "@flow": "outer",
            "inner": {"@task": "nest", "leaf": {"@task": "nope"}},
        }))
        .await;

    let message = format!("{:#}", outcome.expect_err("nested failure"));
    assert!(message.contains("in nested task"), "{message}");
    assert!(message.contains("unknown task"), "{message}");

    let stderr = harness.stderr.text();
    assert_eq!(stderr.matches("error: ").count(), 1, "{stderr}");
}

#[tokio::test]
async fn rendezvous_mailbox_delivers_between_tasks() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "csp",
            "chan": {"@task": "csp.Chan", "mailbox": "jobs"},
            "send": {"@task": "csp.Send", "@after": ["chan"], "mailbox": "jobs", "key": "k", "val": 42},
            "recv": {"@task": "csp.Recv", "@after": ["chan"], "mailbox": "jobs", "timeout": "5s", "msg": null},
        }))
        .await;

    outcome.expect("flow succeeds");
    assert_eq!(flow.final_value()["recv"]["msg"], json!({"key": "k", "val": 42}));
}

#[tokio::test]
async fn sending_to_an_unknown_mailbox_fails() {
    let harness = Harness::new();
    let (_, outcome) = harness
        .run(json!({"@flow": "csp", "send": {"@task": "csp.Send", "mailbox": "nowhere", "val": 1}}))
        .await;

    let message = format!("{:#}", outcome.expect_err("unknown mailbox"));
    assert!(message.contains(r#"channel "nowhere" not found"#), "{message}");
}

#[tokio::test]
async fn scratch_store_round_trips_through_tasks() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "kv",
            "put": {"@task": "kv.Mem", "key": "k", "val": {"n": 1}},
            "take": {"@task": "kv.Mem", "@after": ["put"], "key": "k", "delete": true, "val": null, "loaded": null},
            "again": {"@task": "kv.Mem", "@after": ["take"], "key": "k", "val": null, "loaded": null},
        }))
        .await;

    outcome.expect("flow succeeds");
    let doc = flow.final_value();
    assert_eq!(doc["take"]["val"], json!({"n": 1}));
    assert_eq!(doc["take"]["loaded"], json!(true));
    assert_eq!(doc["again"]["loaded"], json!(false));
    assert!(flow.context().store().is_empty());
}

#[tokio::test]
async fn scratch_store_requires_a_key() {
    let harness = Harness::new();
    let (_, outcome) = harness.run(json!({"@flow": "kv", "mem": {"@task": "kv.Mem"}})).await;

    let message = format!("{:#}", outcome.expect_err("missing key"));
    assert!(message.contains("in kv.Mem task mem: missing field 'key'"), "{message}");
}

#[tokio::test]
async fn contradicting_results_are_conflicts() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({"@flow": "c", "a": {"@task": "emit", "emit": {"n": 2}, "n": 1}}))
        .await;

    let message = format!("{:#}", outcome.expect_err("conflict"));
    assert!(message.contains("conflicting values at a.n: 1 != 2"), "{message}");

    let record = flow.context().find_task(&DocPath::parse("a")).expect("record");
    assert!(record.state().error.is_some());
    assert!(harness.stderr.text().starts_with("error: "));
}

#[tokio::test]
async fn after_accepts_a_single_task_name() {
    let harness = Harness::new();
    let (flow, outcome) = harness
        .run(json!({
            "@flow": "order",
            "first": {"@task": "noop"},
            "second": {"@task": "noop", "@after": "first"},
        }))
        .await;

    outcome.expect("flow succeeds");
    let second = flow.tasks().iter().find(|task| task.path == DocPath::parse("second")).expect("second");
    assert_eq!(second.dependencies, vec![DocPath::parse("first")]);

    let first = flow.context().find_task(&DocPath::parse("first")).expect("record");
    let second = flow.context().find_task(&DocPath::parse("second")).expect("record");
    assert!(first.event("run.end").expect("first ran") <= second.event("run.beg").expect("second ran"));
}

#[tokio::test]
async fn plan_mode_prints_the_task_graph() {
    let harness = Harness::new();
    let modes = RunModes {
        plan: true,
        ..RunModes::default()
    };
    let doc = json!({
        "@flow": "demo",
        "first": {"@task": "noop"},
        "second": {"@task": "noop", "@after": ["first"]},
    });
    let mut flow = Flow::new(harness.context(modes), doc, DocPath::root()).expect("flow");
    flow.start().await.expect("flow succeeds");

    assert_eq!(
        harness.stdout.text(),
        "Flow: demo\nTask: first\nTask: second\n  Depends on: first\n"
    );
}
