//! Storage error types.
//!
//! Every variant carries enough context to diagnose the problem without a
//! debugger. These are [`crate::error`]-local — domain crates translate them
//! into their own error taxonomy rather than leaking storage internals.

/// Errors that can occur during persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or migrate the backend.
    #[error("failed to open storage backend: {reason}")]
    Open { reason: String },

    /// Failed to read one or more rows.
    #[error("failed to read from {table}: {reason}")]
    Read { table: String, reason: String },

    /// Failed to write a row.
    #[error("failed to write to {table}: {reason}")]
    Write { table: String, reason: String },

    /// Failed to delete rows.
    #[error("failed to delete from {table}: {reason}")]
    Delete { table: String, reason: String },

    /// A row referenced by a caller does not exist.
    #[error("row not found in {table}")]
    NotFound { table: String },
}
