//! Flow controller: runs one document (top-level or nested) to completion.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use taskflow_types::{FLOW_MARKER, TASK_MARKER};
use tracing::{error, info, warn};

use crate::adapter::TaskAdapter;
use crate::context::ExecutionContext;
use crate::document::DocPath;
use crate::error::FlowError;
use crate::graph::{EngineConfig, TaskFailure, TaskInfo};

/// A workflow found in a loaded document.
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub name: String,
    pub root: DocPath,
    pub value: Value,
}

/// Lists the workflows in `doc`: the root itself when it carries `@flow`,
/// otherwise every top-level field that does. Non-empty `filters` keep the
/// entries whose name or path matches one of them.
pub fn find_flows(doc: &Value, filters: &[String]) -> Result<Vec<FlowEntry>> {
    let mut found = Vec::new();
    if let Some(name) = doc.get(FLOW_MARKER).and_then(Value::as_str) {
        found.push(FlowEntry {
            name: name.to_string(),
            root: DocPath::root(),
            value: doc.clone(),
        });
    } else if let Value::Object(fields) = doc {
        for (key, value) in fields {
            let Some(name) = value.get(FLOW_MARKER).and_then(Value::as_str) else {
                continue;
            };
            found.push(FlowEntry {
                name: name.to_string(),
                root: DocPath::root().child(key),
                value: value.clone(),
            });
        }
    }

    if found.is_empty() {
        return Err(FlowError::NotAFlow.into());
    }
    if filters.is_empty() {
        return Ok(found);
    }

    let selected: Vec<FlowEntry> = found
        .into_iter()
        .filter(|entry| {
            let path = entry.root.to_string();
            filters.iter().any(|filter| *filter == entry.name || *filter == path)
        })
        .collect();
    if selected.is_empty() {
        bail!("no workflow matches {}", filters.join(", "));
    }
    Ok(selected)
}

pub struct Flow {
    name: String,
    root: DocPath,
    orig: Value,
    final_value: Value,
    tasks: Vec<TaskInfo>,
    ctx: ExecutionContext,
}

impl Flow {
    /// Creates a flow over `value`, which lives at `root` in the outermost document.
    ///
    /// A value with neither a flow nor a task marker is rejected.
    pub fn new(ctx: ExecutionContext, value: Value, root: DocPath) -> Result<Self, FlowError> {
        let flow_name = value.get(FLOW_MARKER).and_then(Value::as_str).map(str::to_string);
        if flow_name.is_none() && value.get(TASK_MARKER).is_none() {
            return Err(FlowError::NotAFlow);
        }
        let name = flow_name.unwrap_or_else(|| if root.is_root() { "flow".to_string() } else { root.to_string() });

        Ok(Self {
            name,
            root,
            final_value: value.clone(),
            orig: value,
            tasks: Vec::new(),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &DocPath {
        &self.root
    }

    pub fn orig(&self) -> &Value {
        &self.orig
    }

    /// Merged document after [`Flow::start`]; the original value before it.
    pub fn final_value(&self) -> &Value {
        &self.final_value
    }

    pub fn tasks(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn is_top_level(&self) -> bool {
        self.ctx.flow_stack().is_empty()
    }

    /// Builds the task graph and runs it. Errors from the engine are reported as
    /// `Error in <name> | <path>: <error>`.
    pub async fn start(&mut self) -> Result<()> {
        let factory = Arc::new(TaskAdapter::new(self.ctx.derive()));
        let config = EngineConfig {
            ignore_concrete: true,
            find_hidden_tasks: true,
            root: self.root.clone(),
            parallelism: None,
        };

        let mut controller = match self.ctx.engine().controller(config, self.orig.clone(), factory) {
            Ok(controller) => controller,
            Err(error) => {
                let error = self.annotate(error);
                self.report_diagnostics();
                return Err(error);
            }
        };
        self.tasks = controller.tasks();

        if self.ctx.modes().shows_graph() && self.is_top_level() {
            self.print_plan()?;
        }

        info!(flow = %self.name, root = %self.root, tasks = self.tasks.len(), "starting flow");
        let result = controller.run(self.ctx.cancel_token().clone()).await;
        self.final_value = controller.value();
        self.report_diagnostics();

        match result {
            Ok(()) => {
                info!(flow = %self.name, "flow finished");
                Ok(())
            }
            Err(error) => Err(self.annotate(error)),
        }
    }

    fn annotate(&self, error: anyhow::Error) -> anyhow::Error {
        match error.downcast_ref::<TaskFailure>() {
            Some(failure) => anyhow!("Error in {} | {}: {:#}", self.name, failure.path, failure.source),
            None if self.root.is_root() => anyhow!("Error in {} | <root>: {:#}", self.name, error),
            None => anyhow!("Error in {} | {}: {:#}", self.name, self.root, error),
        }
    }

    /// Prints accumulated errors, then warnings. Only the outermost flow prints,
    /// so nested failures are reported once.
    fn report_diagnostics(&self) {
        if !self.is_top_level() {
            return;
        }
        for message in self.ctx.errors() {
            error!(flow = %self.name, "{message}");
            if let Err(write_error) = self.ctx.eprint_line(&format!("error: {message}")) {
                warn!(%write_error, "failed to write diagnostics");
            }
        }
        for message in self.ctx.warnings() {
            if let Err(write_error) = self.ctx.eprint_line(&format!("warning: {message}")) {
                warn!(%write_error, "failed to write diagnostics");
            }
        }
    }

    /// Writes the task graph, one `Task:` line per task followed by its dependencies.
    pub fn print_plan(&self) -> Result<()> {
        self.ctx.print_line(&format!("Flow: {}", self.name))?;
        for task in &self.tasks {
            self.ctx.print_line(&format!("Task: {}", task.path))?;
            for dependency in &task.dependencies {
                self.ctx.print_line(&format!("  Depends on: {dependency}"))?;
            }
        }
        Ok(())
    }

    /// Writes per-task run statistics: id, run duration, and dependencies.
    pub fn print_final_context(&self) -> Result<()> {
        self.ctx.print_line(&format!("{:<40} {:>12}  {}", "TASK", "DURATION", "DEPENDS ON"))?;
        for task in &self.tasks {
            let duration = self
                .ctx
                .find_task(&task.path)
                .and_then(|record| record.run_duration())
                .map(|duration| format!("{}ms", duration.num_milliseconds()))
                .unwrap_or_else(|| "-".to_string());
            let dependencies = task.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            self.ctx.print_line(&format!("{:<40} {:>12}  {}", task.path, duration, dependencies))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn root_flow_is_the_only_entry() {
        let doc = json!({"@flow": "main", "inner": {"@flow": "ignored"}});
        let flows = find_flows(&doc, &[]).expect("flows");
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].name, "main");
        assert!(flows[0].root.is_root());
    }

    #[test]
    fn top_level_flows_are_listed_in_document_order() {
        let doc = json!({
            "deploy": {"@flow": "deploy"},
            "data": [1, 2],
            "teardown": {"@flow": "cleanup"},
        });
        let flows = find_flows(&doc, &[]).expect("flows");
        let names: Vec<_> = flows.iter().map(|flow| flow.name.as_str()).collect();
        assert_eq!(names, ["deploy", "cleanup"]);
        assert_eq!(flows[1].root.to_string(), "teardown");
    }

    #[test]
    fn filters_match_name_or_path() {
        let doc = json!({
            "deploy": {"@flow": "deploy"},
            "teardown": {"@flow": "cleanup"},
        });
        let by_path = find_flows(&doc, &["teardown".to_string()]).expect("flows");
        assert_eq!(by_path[0].name, "cleanup");

        let error = find_flows(&doc, &["missing".to_string()]).expect_err("no match");
        assert_eq!(error.to_string(), "no workflow matches missing");
    }

    #[test]
    fn documents_without_flows_are_rejected() {
        let error = find_flows(&json!({"a": 1}), &[]).expect_err("not a flow");
        assert!(matches!(error.downcast_ref::<FlowError>(), Some(FlowError::NotAFlow)));
    }
}
