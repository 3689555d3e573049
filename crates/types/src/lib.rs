//! Shared type definitions for taskflow documents and run options.
//!
//! The engine and the CLI both depend on these definitions: the metadata keys a
//! document node may carry, the serde models those keys decode into, the run
//! mode flags, and the bulk `source@destination` specification.

pub mod bulk;
pub mod meta;
pub mod modes;

pub use bulk::{BulkSpec, BulkSpecError};
pub use meta::{
    AFTER_MARKER, AfterTargets, FLOW_MARKER, INJECT_MARKER_PREFIX, InputDecl, InputPaths, Msg, NodeMeta, OutputDecl, PRINT_MARKER, PrintDirective,
    PrintLevel, TASK_MARKER, parse_inject_marker,
};
pub use modes::RunModes;
