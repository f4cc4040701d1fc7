//! Error types for the driver layer

use thiserror::Error;

/// Result type for driver operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a document-store driver.
///
/// Backends map their native failures onto these variants; the engine
/// never swallows them.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Table does not exist in the store
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Document does not exist
    #[error("document not found: {id}")]
    DocumentNotFound { id: String },

    /// Candidate string is not a valid document id
    #[error("invalid document id: {candidate}")]
    InvalidId { candidate: String },

    /// Pagination cursor does not parse or no longer resolves
    #[error("invalid cursor: {cursor}")]
    InvalidCursor { cursor: String },

    /// Scheduler delay is negative or not a finite number
    #[error("invalid schedule delay: {delay_ms}ms")]
    InvalidDelay { delay_ms: f64 },

    /// Scheduled job not found (cancel of unknown/expired job)
    #[error("scheduled job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend I/O error, including trigger aborts routed through a write
    #[error("storage backend error: {0}")]
    Backend(String),
}
