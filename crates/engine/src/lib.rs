//! # Taskflow Engine
//!
//! Runs JSON/YAML documents as dependency-ordered task graphs. Object nodes
//! carrying an `@task` marker become tasks; a graph engine orders them, fills
//! `${{ path }}` references, and releases them concurrently once their
//! dependencies have completed. Each task's output is merged back into the
//! document through a monotonic unify, so values can be refined but never
//! contradicted.
//!
//! ## Usage
//!
//! ```rust
//! use taskflow_engine::{ContextBuilder, Flow, default_context, document::DocPath};
//!
//! # let runtime = tokio::runtime::Runtime::new()?;
//! # runtime.block_on(async {
//! let ctx = default_context(ContextBuilder::new());
//! let doc = serde_json::json!({
//!     "@flow": "hello",
//!     "step": {"@task": "noop", "greeting": "hi"},
//! });
//! let mut flow = Flow::new(ctx, doc, DocPath::root())?;
//! flow.start().await?;
//! # Ok::<(), anyhow::Error>(())
//! # })?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **`context`**: per-run shared state plus per-task working state
//! - **`registry`**: task constructors and the middleware chain
//! - **`adapter`**: bridges registered runners to the graph engine
//! - **`graph`**: the engine contract and the dependency-ordered reference engine
//! - **`flow`**: runs one document, top-level or nested
//! - **`bulk`**: fans flows out over a collection on a bounded pool
//! - **`tasks`**: built-in task types (`noop`, `nest`, `csp.*`, `kv.Mem`)

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde_json::Value;

pub mod adapter;
pub mod bulk;
pub mod context;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod flow;
pub mod graph;
pub mod mailbox;
pub mod middleware;
pub mod registry;
pub mod store;
pub mod task;
pub mod tasks;
pub mod templates;
pub mod vars;

pub use bulk::{BulkDriver, BulkSummary, ContextFactory};
pub use context::{ContextBuilder, ExecutionContext};
pub use error::FlowError;
pub use flow::{Flow, FlowEntry, find_flows};
pub use graph::{DependencyEngine, GraphEngine, TaskFactory, TaskRunnable};
pub use registry::{Constructor, Middleware, Runner, constructor};
pub use task::{PartialResult, TaskRecord};

/// Builds a context with the built-in task types and default middlewares installed.
pub fn default_context(builder: ContextBuilder) -> ExecutionContext {
    let ctx = builder.build();
    tasks::register_defaults(&ctx);
    middleware::use_defaults(&ctx);
    ctx
}

/// Loads a workflow document from disk.
///
/// YAML is a superset of JSON, so both formats go through the YAML parser.
/// Mapping order is preserved.
pub fn load_document_file(file_path: impl AsRef<Path>) -> Result<Value> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read workflow file: {}", file_path.display()))?;
    let document: Value =
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse workflow file: {}", file_path.display()))?;
    if !document.is_object() {
        anyhow::bail!("workflow file {} must contain a mapping at the top level", file_path.display());
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_documents_in_authoring_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workflow_path = temp_dir.path().join("workflow.yaml");
        fs::write(
            &workflow_path,
            r#"
"@flow": deploy
zeta:
  "@task": noop
alpha:
  "@task": noop
  "@after": [zeta]
"#,
        )
        .unwrap();

        let document = load_document_file(&workflow_path).expect("load yaml");
        assert_eq!(document["@flow"], "deploy");
        let keys: Vec<_> = document.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["@flow", "zeta", "alpha"]);
    }

    #[test]
    fn loads_json_documents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workflow_path = temp_dir.path().join("workflow.json");
        fs::write(&workflow_path, r#"{"@flow": "x", "t": {"@task": "noop", "n": 1}}"#).unwrap();

        let document = load_document_file(&workflow_path).expect("load json");
        assert_eq!(document["t"]["n"], 1);
    }

    #[test]
    fn rejects_missing_and_scalar_documents() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(load_document_file(temp_dir.path().join("absent.yaml")).is_err());

        let scalar = temp_dir.path().join("scalar.yaml");
        fs::write(&scalar, "42\n").unwrap();
        let error = load_document_file(&scalar).expect_err("scalar document");
        assert!(error.to_string().contains("mapping at the top level"));
    }

    #[test]
    fn default_context_registers_builtins() {
        let ctx = default_context(ContextBuilder::new());
        let mut types = ctx.task_types();
        types.sort();
        assert_eq!(types, ["csp.Chan", "csp.Recv", "csp.Send", "kv.Mem", "nest", "noop"]);
    }
}
