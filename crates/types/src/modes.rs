use serde::{Deserialize, Serialize};

/// Run mode flags shared by every task in a run.
///
/// The core only inspects `plan` and `preview` (to print the task graph before
/// running); the remaining flags are carried for task implementations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunModes {
    #[serde(default)]
    pub plan: bool,
    #[serde(default)]
    pub apply: bool,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub preview: bool,
    /// Diagnostic verbosity; 0 is quiet.
    #[serde(default)]
    pub verbosity: u8,
}

impl RunModes {
    /// True when the task graph should be printed before running.
    pub fn shows_graph(&self) -> bool {
        self.plan || self.preview
    }
}
