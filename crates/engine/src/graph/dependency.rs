//! Reference-based dependency engine.
//!
//! Discovery offers every object node, in document order, to the task factory
//! and does not descend into nodes it accepts. A task depends on another when it
//! references it through a `${{ path }}` template, through an `inputs` entry of
//! the form `tasks.<id>.outputs.<name>`, or explicitly through `@after`.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use taskflow_types::{AFTER_MARKER, AfterTargets, TASK_MARKER};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Controller, EngineConfig, GraphEngine, GraphNode, GraphTask, TaskFactory, TaskFailure, TaskInfo, TaskRunnable};
use crate::document::{self, DocPath};
use crate::error::FlowError;
use crate::templates::{collect_template_expressions, substitute_templates};

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyEngine;

impl GraphEngine for DependencyEngine {
    fn controller(&self, config: EngineConfig, doc: Value, factory: Arc<dyn TaskFactory>) -> Result<Box<dyn Controller>> {
        let mut tasks = Vec::new();
        discover(&config, &doc, &DocPath::root(), factory.as_ref(), &mut tasks)?;
        let dependencies = infer_dependencies(&tasks)?;
        let order = order_tasks(&tasks, &dependencies)?;
        debug!(root = %config.root, tasks = tasks.len(), "built task graph");

        Ok(Box::new(DependencyController {
            config,
            doc: Arc::new(Mutex::new(doc)),
            tasks,
            dependencies,
            order,
        }))
    }
}

struct DiscoveredTask {
    path: DocPath,
    local_path: DocPath,
    value: Value,
    runnable: Arc<dyn TaskRunnable>,
}

fn discover(
    config: &EngineConfig,
    value: &Value,
    local_path: &DocPath,
    factory: &dyn TaskFactory,
    tasks: &mut Vec<DiscoveredTask>,
) -> Result<()> {
    if value.is_object() {
        let node = GraphNode {
            path: config.root.join(local_path),
            local_path: local_path.clone(),
            value,
        };
        if let Some(runnable) = factory.make(&node)? {
            tasks.push(DiscoveredTask {
                path: node.path,
                local_path: node.local_path,
                value: value.clone(),
                runnable,
            });
            return Ok(());
        }
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.starts_with('@') || (key.starts_with('_') && !config.find_hidden_tasks) {
                    continue;
                }
                discover(config, child, &local_path.child(key.as_str()), factory, tasks)?;
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                discover(config, child, &local_path.child(index.to_string()), factory, tasks)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn infer_dependencies(tasks: &[DiscoveredTask]) -> Result<Vec<Vec<usize>>> {
    let mut dependencies = Vec::with_capacity(tasks.len());

    for (index, task) in tasks.iter().enumerate() {
        let mut found = BTreeSet::new();

        for expression in collect_template_expressions(&task.value) {
            let reference = DocPath::parse(&expression);
            for (other_index, other) in tasks.iter().enumerate() {
                if other_index == index {
                    continue;
                }
                let inside_other = reference.starts_with(&other.local_path);
                let encloses_other = other.local_path.starts_with(&reference) && !task.local_path.starts_with(&reference);
                if inside_other || encloses_other {
                    found.insert(other_index);
                }
            }
        }

        for path in input_paths(&task.value) {
            let Some(rest) = path.strip_prefix("tasks.") else {
                continue;
            };
            for (other_index, other) in tasks.iter().enumerate() {
                let id = other.path.to_string();
                let outputs = format!("{id}.outputs");
                if other_index != index && (rest == outputs || rest.starts_with(&format!("{outputs}."))) {
                    found.insert(other_index);
                }
            }
        }

        let targets = after_targets(&task.value).with_context(|| format!("in task '{}'", task.path))?;
        for target in targets {
            let target_path = DocPath::parse(&target);
            if target_path == task.local_path {
                bail!("task '{}' cannot depend on itself", task.path);
            }
            let mut matched = false;
            for (other_index, other) in tasks.iter().enumerate() {
                if other_index != index && other.local_path.starts_with(&target_path) {
                    found.insert(other_index);
                    matched = true;
                }
            }
            if !matched {
                bail!("task '{}' depends on unknown task '{}'", task.path, target);
            }
        }

        dependencies.push(found.into_iter().collect());
    }

    Ok(dependencies)
}

/// Input paths declared by a task and by every task nested inside it, so a
/// nested flow waits for the outer tasks its children read from.
fn input_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_input_paths(value, true, &mut paths);
    paths
}

fn collect_input_paths(value: &Value, top: bool, paths: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if (top || map.contains_key(TASK_MARKER))
                && let Some(inputs) = map.get("inputs").and_then(Value::as_array)
            {
                for declared in inputs.iter().filter_map(|input| input.get("value")) {
                    match declared {
                        Value::String(path) => paths.push(path.clone()),
                        Value::Array(items) => paths.extend(items.iter().filter_map(Value::as_str).map(str::to_string)),
                        _ => {}
                    }
                }
            }
            for (key, child) in map {
                if key.starts_with('@') || key == "inputs" {
                    continue;
                }
                collect_input_paths(child, false, paths);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_input_paths(item, false, paths);
            }
        }
        _ => {}
    }
}

/// `@after` takes one task path or a list of them.
fn after_targets(value: &Value) -> Result<Vec<String>> {
    let Some(after) = value.get(AFTER_MARKER) else {
        return Ok(Vec::new());
    };
    let after: AfterTargets =
        serde_json::from_value(after.clone()).map_err(|_| anyhow!("{AFTER_MARKER} must be a task path or a list of task paths"))?;
    Ok(after.targets().into_iter().map(str::to_string).collect())
}

/// Kahn ordering over discovery indices; errors name every task left in a cycle.
fn order_tasks(tasks: &[DiscoveredTask], dependencies: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut in_degrees: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for (index, task_dependencies) in dependencies.iter().enumerate() {
        for dependency in task_dependencies {
            dependents.entry(*dependency).or_default().push(index);
        }
    }

    let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|index| in_degrees[*index] == 0).collect();
    let mut ordered = Vec::with_capacity(tasks.len());
    while let Some(index) = queue.pop_front() {
        ordered.push(index);
        if let Some(children) = dependents.get(&index) {
            for child in children {
                in_degrees[*child] -= 1;
                if in_degrees[*child] == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if ordered.len() != tasks.len() {
        let mut remaining: Vec<String> = in_degrees
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(index, _)| tasks[index].path.to_string())
            .collect();
        remaining.sort();
        bail!("cycle detected in workflow tasks involving: {}", remaining.join(", "));
    }

    Ok(ordered)
}

struct DependencyController {
    config: EngineConfig,
    doc: Arc<Mutex<Value>>,
    tasks: Vec<DiscoveredTask>,
    dependencies: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyController {
    /// Substitutes references against the current document and hands out the task handle.
    fn release(&self, index: usize) -> Result<GraphTask> {
        let task = &self.tasks[index];
        let mut doc = self.doc.lock().expect("document lock");
        let mut node = document::lookup(&doc, &task.local_path).cloned().unwrap_or(Value::Null);

        let unresolved = substitute_templates(&mut node, &|expression: &str| {
            document::lookup(&doc, &DocPath::parse(expression))
                .filter(|value| !document::is_placeholder(value))
                .cloned()
        });
        if !unresolved.is_empty() {
            let expressions: Vec<&str> = unresolved.iter().map(|reference| reference.expression.as_str()).collect();
            if !self.config.ignore_concrete {
                bail!("task {} has unresolved references: {}", task.path, expressions.join(", "));
            }
            debug!(task = %task.path, unresolved = ?expressions, "releasing task with unresolved references");
        }
        document::set_path(&mut doc, &task.local_path, node);
        drop(doc);

        let dependencies = self.dependencies[index].iter().map(|dependency| self.tasks[*dependency].path.clone()).collect();
        Ok(GraphTask::new(task.path.clone(), task.local_path.clone(), index, dependencies, Arc::clone(&self.doc)))
    }
}

#[async_trait]
impl Controller for DependencyController {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let total = self.tasks.len();
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        for (index, task_dependencies) in self.dependencies.iter().enumerate() {
            for dependency in task_dependencies {
                dependents[*dependency].push(index);
            }
        }

        let mut ready: VecDeque<usize> = self.order.iter().copied().filter(|index| pending[*index] == 0).collect();
        let limit = self.config.parallelism.unwrap_or(usize::MAX).max(1);
        let mut running = JoinSet::new();
        let mut failure: Option<anyhow::Error> = None;
        let mut completed = 0usize;

        loop {
            while failure.is_none() && !cancel.is_cancelled() && running.len() < limit {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                match self.release(index) {
                    Ok(task) => {
                        let runnable = Arc::clone(&self.tasks[index].runnable);
                        debug!(task = %task.path(), "releasing task");
                        running.spawn(async move {
                            let result = runnable.run(&task).await;
                            (index, result)
                        });
                    }
                    Err(error) => failure = Some(error),
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((index, Ok(()))) => {
                    completed += 1;
                    for dependent in &dependents[index] {
                        pending[*dependent] -= 1;
                        if pending[*dependent] == 0 {
                            ready.push_back(*dependent);
                        }
                    }
                }
                Ok((index, Err(source))) => {
                    if failure.is_none() {
                        failure = Some(
                            TaskFailure {
                                path: self.tasks[index].path.clone(),
                                source,
                            }
                            .into(),
                        );
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        failure = Some(anyhow!("task aborted: {join_error}"));
                    }
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        if completed < total {
            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled.into());
            }
            bail!("{} task(s) never became ready", total - completed);
        }
        info!(root = %self.config.root, tasks = total, "task graph completed");
        Ok(())
    }

    fn value(&self) -> Value {
        self.doc.lock().expect("document lock").clone()
    }

    fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| TaskInfo {
                path: task.path.clone(),
                dependencies: self.dependencies[index].iter().map(|dependency| self.tasks[*dependency].path.clone()).collect(),
            })
            .collect()
    }
}
