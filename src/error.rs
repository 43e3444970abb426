//! Error types for the audit library.

use thiserror::Error;

/// Hard failure conditions for an audit run.
///
/// Almost everything the auditor observes (transient divergence, missing
/// files, stale replicas) is a soft finding that lands in the report as a
/// warning. The variants here are the exceptions: they abort the run.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Malformed or unrecognized relation-type selection. Raised before
    /// any filesystem access.
    #[error("invalid relation type selection: {0}")]
    InvalidParameter(String),

    /// The caller asked us to stop via the cancel token.
    #[error("audit cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
