use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::Value;

/// Scratch key-value store shared by every task of a run.
#[derive(Debug, Clone, Default)]
pub struct ScratchStore {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl ScratchStore {
    pub fn store(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().expect("scratch store lock").insert(key.into(), value);
    }

    pub fn load(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("scratch store lock").get(key).cloned()
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().expect("scratch store lock").remove(key);
    }

    /// Removes the entry and returns what it held, atomically.
    pub fn load_and_delete(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("scratch store lock").remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("scratch store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
