//! Error types for objsweep
//!
//! Per-object failures (`Fetch`, `Analysis`) are recoverable by skipping the
//! object; everything else stops the sweep unless a caller policy says otherwise.

use thiserror::Error;

/// Result type alias for sweep operations
pub type Result<T> = std::result::Result<T, SweepError>;

/// Main error type for a sweep
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Object source unavailable for s3://{bucket}/{prefix}: {cause}")]
    SourceUnavailable {
        bucket: String,
        prefix: String,
        cause: String,
    },

    #[error("Destination unavailable: {cause}")]
    DestinationUnavailable { cause: String },

    #[error("Failed to fetch '{key}': {reason}")]
    Fetch { key: String, reason: String },

    #[error("Extension '{extension}' failed for '{key}': {cause}")]
    Analysis {
        extension: String,
        key: String,
        cause: String,
    },

    #[error("Schema mismatch for '{key}': expected columns [{}], found [{}]", .expected.join(", "), .found.join(", "))]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
        key: String,
    },

    #[error("Failed to persist batch of {records} records: {cause}")]
    Persist { records: usize, cause: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid SQL identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SweepError {
    pub fn fetch(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SweepError::Fetch {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SweepError::Config(message.into())
    }

    /// Whether this error must stop the sweep regardless of skip policies
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SweepError::Fetch { .. } | SweepError::Analysis { .. })
    }
}
