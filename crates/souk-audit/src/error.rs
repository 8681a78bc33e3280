//! Error types for the audit log.

/// Errors that can occur while writing or reading audit entries.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A database operation failed.
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Detail serialization or deserialization failed.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
