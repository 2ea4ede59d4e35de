//! Storage backend abstraction for Agent Key.
//!
//! This crate defines the [`StorageBackend`] trait, a key-value interface
//! that knows nothing about secrets, policies, or checkouts. Records are
//! serialized by `agentkey-core` before they reach this layer.
//!
//! There is no delete operation. Records are created and overwritten, never
//! removed.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBackend`]: in-memory, for tests and local development
//! - [`RocksDbBackend`]: persistent, backed by `RocksDB` (feature `rocksdb-backend`)

mod batch;
mod error;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use batch::{Precondition, WriteBatch};
pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `checkout/<id>`,
/// `audit/<tenant>/<seq>`). Values are opaque byte arrays.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair unconditionally, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Return every key-value pair under the given prefix, in ascending key
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Atomically apply a [`WriteBatch`].
    ///
    /// Every precondition is checked against the current state first. If any
    /// precondition fails, nothing is written and
    /// [`StorageError::Conflict`] names the offending key. Otherwise all
    /// writes become visible together. Concurrent commits are serialized, so
    /// a successful commit never interleaves with another.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if a precondition does not hold.
    /// - [`StorageError::Transaction`] if the backend cannot apply the batch.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
