//! Error types for the TDDF pipeline.

use crate::artifact::ArtifactId;
use crate::phase::Phase;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by pipeline operations.
///
/// Line-local problems never appear here; they are [`DecodeError`]s that the
/// backlog processor turns into skipped lines.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Failed to open or read an input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV report writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The backing store could not be read or written
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No artifact with this id exists
    #[error("artifact {0} not found")]
    ArtifactNotFound(ArtifactId),

    /// The requested phase change is not an edge of the state machine
    #[error("artifact {artifact}: invalid transition {from} -> {to}")]
    InvalidTransition {
        artifact: ArtifactId,
        from: Phase,
        to: Phase,
    },

    /// Retry ceiling reached; the artifact is now failed
    #[error("artifact {artifact} exhausted {retries} retries")]
    RetryExhausted { artifact: ArtifactId, retries: u32 },

    /// The caller no longer owns the lease it was working under
    #[error("lease on {key} is not held by {owner}")]
    LeaseLost { key: String, owner: String },

    /// The artifact still has lines that are not yet decoded
    #[error("artifact {artifact} still has {outstanding} lines pending or processing")]
    ArtifactBusy {
        artifact: ArtifactId,
        outstanding: usize,
    },

    /// A configuration value could not be parsed or is out of range
    #[error("invalid configuration {key}={value}")]
    InvalidConfig { key: String, value: String },

    /// Missing input file argument
    #[error("Missing input file argument. Usage: tddf-pipeline <file.tddf>...")]
    MissingArgument,
}

impl PipelineError {
    /// Storage outages halt the current operation and are retried next cycle.
    pub fn is_storage(&self) -> bool {
        matches!(self, PipelineError::StorageUnavailable(_))
    }
}

/// Line-local decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Nothing to decode on this line
    #[error("line {line} is blank")]
    BlankLine { line: u32 },
}
