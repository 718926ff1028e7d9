//! Crate-wide error taxonomy.
//!
//! Per the error-handling design, almost nothing here is fatal: failures are
//! absorbed by the pipeline and surfaced only through `tracing` logs. The
//! variants below exist so callers that *do* want to inspect a failure
//! (tests, the out-of-scope diagnostic CLI) have something structured to
//! match on.

/// Result type for memory-engine operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Error kinds produced by the memory engine.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("oracle failure: {0}")]
    Oracle(String),

    #[error("graph integrity error: {0}")]
    Graph(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown memory error: {0}")]
    Other(String),
}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        MemoryError::Other(err.to_string())
    }
}

impl From<regex::Error> for MemoryError {
    fn from(err: regex::Error) -> Self {
        MemoryError::Other(format!("regex error: {err}"))
    }
}
