//! Node metadata conventions.
//!
//! A document node is a JSON object. Keys prefixed with `@` are engine metadata;
//! `inputs` and `outputs` are read only from nodes that carry a task marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marks a node as a task and names its registered type.
pub const TASK_MARKER: &str = "@task";
/// Marks a node as a workflow root and carries the flow name.
pub const FLOW_MARKER: &str = "@flow";
/// Print directive consumed by the print middleware.
pub const PRINT_MARKER: &str = "@print";
/// Explicit ordering hint listing node paths a task must run after.
pub const AFTER_MARKER: &str = "@after";
/// Prefix of a string field that should be replaced with an input value at run time.
pub const INJECT_MARKER_PREFIX: &str = "@runinject(";

/// Metadata decoded from a task node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMeta {
    /// Registered task type identifier.
    #[serde(rename = "@task", default)]
    pub task: Option<String>,
    /// Flow name when the node is a workflow root.
    #[serde(rename = "@flow", default)]
    pub flow: Option<String>,
    #[serde(rename = "@print", default)]
    pub print: Option<PrintDirective>,
    #[serde(rename = "@after", default)]
    pub after: AfterTargets,
    /// Values resolved from the global variable store and spliced into `@runinject` fields.
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    /// Fields of the merged task value published under `tasks.<id>.outputs`.
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
}

impl NodeMeta {
    /// Decodes metadata from a node value. Non-object values carry no metadata.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        if !value.is_object() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    pub fn input(&self, alias: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|input| input.alias == alias)
    }
}

/// One entry of a node's `inputs` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputDecl {
    pub alias: String,
    pub value: InputPaths,
}

/// `@after` targets: one node path or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AfterTargets {
    One(String),
    Many(Vec<String>),
}

impl Default for AfterTargets {
    fn default() -> Self {
        AfterTargets::Many(Vec::new())
    }
}

impl AfterTargets {
    pub fn targets(&self) -> Vec<&str> {
        match self {
            AfterTargets::One(target) => vec![target.as_str()],
            AfterTargets::Many(targets) => targets.iter().map(String::as_str).collect(),
        }
    }
}

/// A single dotted path or a list of them. A list resolves to a list of values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InputPaths {
    One(String),
    Many(Vec<String>),
}

impl InputPaths {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            InputPaths::One(path) => vec![path.as_str()],
            InputPaths::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// A declared output.
///
/// `Name` publishes the field of the same (dotted) name; `Mapped` publishes the value at
/// `path` under `alias`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutputDecl {
    Name(String),
    Mapped { alias: String, path: Vec<String> },
}

impl OutputDecl {
    /// Name the output is published under.
    pub fn name(&self) -> &str {
        match self {
            OutputDecl::Name(name) => name,
            OutputDecl::Mapped { alias, .. } => alias,
        }
    }

    /// Segments locating the output inside the task value.
    pub fn source_segments(&self) -> Vec<String> {
        match self {
            OutputDecl::Name(name) => name.split('.').filter(|segment| !segment.is_empty()).map(str::to_string).collect(),
            OutputDecl::Mapped { path, .. } => path.clone(),
        }
    }
}

/// `@print` directive. Either a bare field path or a detailed object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PrintDirective {
    Path(String),
    Detailed {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        level: PrintLevel,
        #[serde(default)]
        before: bool,
    },
}

impl PrintDirective {
    /// Field path to print; `None` prints the whole node value.
    pub fn path(&self) -> Option<&str> {
        match self {
            PrintDirective::Path(path) if path.is_empty() => None,
            PrintDirective::Path(path) => Some(path),
            PrintDirective::Detailed { path, .. } => path.as_deref(),
        }
    }

    pub fn level(&self) -> PrintLevel {
        match self {
            PrintDirective::Path(_) => PrintLevel::Stdout,
            PrintDirective::Detailed { level, .. } => *level,
        }
    }

    /// Whether to print the value as it was before the task ran.
    pub fn before(&self) -> bool {
        matches!(self, PrintDirective::Detailed { before: true, .. })
    }
}

/// Where a print directive writes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrintLevel {
    #[default]
    Stdout,
    Stderr,
    Log,
}

/// Message carried over a mailbox channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Msg {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub val: Value,
}

/// Extracts the alias from a `@runinject(<alias>)` marker string.
pub fn parse_inject_marker(value: &str) -> Option<&str> {
    let alias = value.trim().strip_prefix(INJECT_MARKER_PREFIX)?.strip_suffix(')')?.trim();
    if alias.is_empty() { None } else { Some(alias) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_task_metadata_and_ignores_data_fields() {
        let node = json!({
            "@task": "kv.Mem",
            "@after": ["setup"],
            "key": "k",
            "inputs": [{"alias": "count", "value": "tasks.a.outputs.x"}],
            "outputs": ["val", {"alias": "flag", "path": ["loaded"]}]
        });

        let meta = NodeMeta::from_value(&node).expect("decode");
        assert_eq!(meta.task.as_deref(), Some("kv.Mem"));
        assert_eq!(meta.after.targets(), vec!["setup"]);
        assert_eq!(meta.input("count").expect("input").value.paths(), vec!["tasks.a.outputs.x"]);
        assert_eq!(meta.outputs[0].name(), "val");
        assert_eq!(meta.outputs[1].name(), "flag");
        assert_eq!(meta.outputs[1].source_segments(), vec!["loaded".to_string()]);
    }

    #[test]
    fn after_accepts_a_single_path() {
        let meta = NodeMeta::from_value(&json!({"@task": "noop", "@after": "first"})).expect("decode");
        assert_eq!(meta.after, AfterTargets::One("first".into()));
        assert_eq!(meta.after.targets(), vec!["first"]);
        assert!(NodeMeta::default().after.targets().is_empty());
    }

    #[test]
    fn decodes_metadata_from_yaml_document() {
        let yaml = r#"
"@flow": deploy
"@print": { path: result, level: stderr, before: true }
"#;
        let value: Value = serde_yaml::from_str(yaml).expect("yaml");
        let meta = NodeMeta::from_value(&value).expect("decode");
        assert_eq!(meta.flow.as_deref(), Some("deploy"));
        let print = meta.print.expect("print directive");
        assert_eq!(print.path(), Some("result"));
        assert_eq!(print.level(), PrintLevel::Stderr);
        assert!(print.before());
    }

    #[test]
    fn parses_inject_markers() {
        assert_eq!(parse_inject_marker("@runinject(count)"), Some("count"));
        assert_eq!(parse_inject_marker(" @runinject( count ) "), Some("count"));
        assert_eq!(parse_inject_marker("@runinject()"), None);
        assert_eq!(parse_inject_marker("count"), None);
    }
}
