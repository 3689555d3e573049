//! Bulk fan-out specification (`<src.path>@<dst.path>`).

use std::str::FromStr;

use thiserror::Error;

/// Splits a collection at `source` into one job per element, placing each element at
/// `destination` inside a fresh copy of the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSpec {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BulkSpecError {
    #[error("bad format for bulk, requires <src.path>@<dst.path>, got {0:?}")]
    BadFormat(String),
}

impl FromStr for BulkSpec {
    type Err = BulkSpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split('@').collect();
        match parts.as_slice() {
            [source, destination] if !source.trim().is_empty() && !destination.trim().is_empty() => Ok(Self {
                source: source.trim().to_string(),
                destination: destination.trim().to_string(),
            }),
            _ => Err(BulkSpecError::BadFormat(raw.to_string())),
        }
    }
}
