//! Run-wide global variable store.

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::document::{DocPath, lookup, set_path};

/// Hierarchical variable map addressed by dotted paths such as `tasks.<id>.outputs.<name>`.
///
/// Writes are last-write-wins. Clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct GlobalVars {
    root: Arc<RwLock<Value>>,
}

impl Default for GlobalVars {
    fn default() -> Self {
        Self {
            root: Arc::new(RwLock::new(Value::Object(Map::new()))),
        }
    }
}

impl GlobalVars {
    pub fn set(&self, path: &str, value: Value) {
        let path = DocPath::parse(path);
        let mut root = self.root.write().expect("global vars lock");
        set_path(&mut root, &path, value);
    }

    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = DocPath::parse(path);
        if path.is_root() {
            return None;
        }
        let root = self.root.read().expect("global vars lock");
        lookup(&root, &path).cloned()
    }

    /// Copy of the whole variable tree.
    pub fn snapshot(&self) -> Value {
        self.root.read().expect("global vars lock").clone()
    }

    /// Publishes a task output under `tasks.<task_id>.outputs.<name>`.
    pub fn publish_output(&self, task_id: &str, name: &str, value: Value) {
        self.set(&output_variable_path(task_id, name), value);
    }
}

pub fn output_variable_path(task_id: &str, name: &str) -> String {
    format!("tasks.{task_id}.outputs.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_write_wins_and_lookup_descends() {
        let vars = GlobalVars::default();
        vars.publish_output("build", "image", json!("v1"));
        vars.publish_output("build", "image", json!("v2"));
        assert_eq!(vars.lookup("tasks.build.outputs.image"), Some(json!("v2")));
        assert_eq!(vars.lookup("tasks.build.outputs"), Some(json!({"image": "v2"})));
        assert_eq!(vars.lookup("tasks.deploy"), None);
        assert_eq!(vars.lookup(""), None);
    }

    #[test]
    fn clones_share_state() {
        let vars = GlobalVars::default();
        let other = vars.clone();
        other.set("a.b", json!(1));
        assert_eq!(vars.snapshot(), json!({"a": {"b": 1}}));
    }
}
