//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Values are never included, only keys.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open the storage backend at the given path.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to list keys with the given prefix.
    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A commit precondition did not hold; nothing was written.
    #[error("conditional commit rejected: key '{key}' changed")]
    Conflict { key: String },

    /// Failed to apply an atomic batch.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A storage key contained invalid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },
}

impl StorageError {
    /// Whether this error is a lost optimistic-concurrency race rather than
    /// a backend failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
