//! Bulk and parallel run driver.
//!
//! Each job runs one flow in its own [`ExecutionContext`]. Without a bulk
//! specification every selected flow is one job; with one, every element of the
//! source collection becomes a job whose flow has the element spliced in at the
//! destination path. Jobs run on a pool bounded by the configured parallelism,
//! failures are counted without stopping sibling jobs, and the run fails after
//! all jobs finish when any of them failed.

use std::{
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use serde_json::Value;
use taskflow_types::BulkSpec;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

use crate::context::ExecutionContext;
use crate::document::{self, DocPath};
use crate::error::FlowError;
use crate::flow::{Flow, FlowEntry};

/// Builds a fresh, fully registered context for one job.
pub type ContextFactory = Arc<dyn Fn() -> ExecutionContext + Send + Sync>;

/// One unit of work submitted to the pool.
#[derive(Debug, Clone)]
pub struct Job {
    pub label: String,
    pub root: DocPath,
    pub value: Value,
    /// Destination (relative to the flow value) and the element to place there.
    pub splice: Option<(DocPath, Value)>,
}

/// Final document of every job that succeeded, keyed by job label.
#[derive(Debug, Default)]
pub struct BulkSummary {
    pub jobs: usize,
    pub finals: Vec<(String, Value)>,
}

pub struct BulkDriver {
    parallel: usize,
    spec: Option<BulkSpec>,
    print_stats: bool,
    make_context: ContextFactory,
}

impl BulkDriver {
    pub fn new(make_context: ContextFactory) -> Self {
        Self {
            parallel: 1,
            spec: None,
            print_stats: false,
            make_context,
        }
    }

    /// Pool size; values below one are treated as one.
    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn bulk(mut self, spec: Option<BulkSpec>) -> Self {
        self.spec = spec;
        self
    }

    pub fn print_stats(mut self, print_stats: bool) -> Self {
        self.print_stats = print_stats;
        self
    }

    /// Expands the selected flows into jobs.
    pub fn jobs(&self, doc: &Value, flows: &[FlowEntry]) -> Result<Vec<Job>> {
        let Some(spec) = &self.spec else {
            return Ok(flows
                .iter()
                .map(|flow| Job {
                    label: flow.name.clone(),
                    root: flow.root.clone(),
                    value: flow.value.clone(),
                    splice: None,
                })
                .collect());
        };

        let source =
            document::lookup(doc, &DocPath::parse(&spec.source)).ok_or_else(|| FlowError::BulkSourceMissing(spec.source.clone()))?;
        let elements: Vec<Value> = match source {
            Value::Array(items) => items.clone(),
            Value::Object(fields) => fields.values().cloned().collect(),
            _ => return Err(FlowError::NotIterable(spec.source.clone()).into()),
        };
        let destination = DocPath::parse(&spec.destination);

        let mut jobs = Vec::with_capacity(flows.len() * elements.len());
        for flow in flows {
            for (index, element) in elements.iter().enumerate() {
                jobs.push(Job {
                    label: format!("{}[{index}]", flow.name),
                    root: flow.root.clone(),
                    value: flow.value.clone(),
                    splice: Some((destination.clone(), element.clone())),
                });
            }
        }
        Ok(jobs)
    }

    /// Runs every job and returns the aggregate outcome. When any job fails the
    /// error is [`FlowError::Aggregate`], still carrying the successful finals.
    pub async fn run(&self, doc: &Value, flows: &[FlowEntry]) -> Result<BulkSummary> {
        let jobs = self.jobs(doc, flows)?;
        let total = jobs.len();
        info!(jobs = total, parallel = self.parallel, "starting run");

        let pool = Arc::new(Semaphore::new(self.parallel));
        let failures = Arc::new(AtomicUsize::new(0));
        let mut running = JoinSet::new();

        for job in jobs {
            let permit = Arc::clone(&pool).acquire_owned().await.context("worker pool closed")?;
            let ctx = (self.make_context)();
            let failures = Arc::clone(&failures);
            let print_stats = self.print_stats;
            running.spawn(async move {
                let _permit = permit;
                let label = job.label.clone();
                let stderr = ctx.stderr();
                match run_job(ctx, job, print_stats).await {
                    Ok(final_value) => Some((label, final_value)),
                    Err(job_error) => {
                        failures.fetch_add(1, Ordering::SeqCst);
                        error!(job = %label, error = %format!("{job_error:#}"), "job failed");
                        let mut out = stderr.lock().expect("stderr lock");
                        if let Err(write_error) = writeln!(out, "{label}: {job_error:#}") {
                            warn!(job = %label, %write_error, "failed to write job failure");
                        }
                        None
                    }
                }
            });
        }

        let mut summary = BulkSummary {
            jobs: total,
            finals: Vec::new(),
        };
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Some(finished)) => summary.finals.push(finished),
                Ok(None) => {}
                Err(join_error) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    error!(error = %join_error, "job aborted");
                }
            }
        }

        let failed = failures.load(Ordering::SeqCst);
        if failed > 0 {
            return Err(FlowError::Aggregate {
                failed,
                finals: summary.finals,
            }
            .into());
        }
        info!(jobs = total, "run finished");
        Ok(summary)
    }
}

async fn run_job(ctx: ExecutionContext, job: Job, print_stats: bool) -> Result<Value> {
    let mut value = job.value;
    if let Some((destination, element)) = &job.splice {
        ctx.evaluator()
            .fill_path(&mut value, destination, element)
            .with_context(|| format!("failed to place bulk element at {destination}"))?;
    }

    let mut flow = Flow::new(ctx, value, job.root)?;
    let outcome = flow.start().await;
    if print_stats {
        flow.print_final_context()?;
    }
    outcome?;
    Ok(flow.final_value().clone())
}
