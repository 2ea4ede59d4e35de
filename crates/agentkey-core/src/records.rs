//! Typed JSON records over the raw storage backend.
//!
//! [`RecordStore`] serializes records with `serde_json` and remembers the
//! exact bytes it read in a [`Versioned`] wrapper. A [`Transaction`] turns
//! those bytes into compare-and-swap preconditions, so a read-modify-write
//! commits only if nobody else changed the record in between.

use std::sync::Arc;

use agentkey_storage::{StorageBackend, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RecordError;

/// How many times a read-modify-write is attempted before a persistent
/// conflict is surfaced to the caller.
pub const MAX_COMMIT_ATTEMPTS: usize = 8;

/// Default page size for listings.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page size a caller may request.
pub const MAX_PAGE_LIMIT: usize = 200;

/// A record together with the exact bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// The storage key.
    pub key: String,
    /// The decoded record.
    pub value: T,
    raw: Vec<u8>,
}

impl<T> Versioned<T> {
    /// Consume the wrapper, returning the record.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Offset pagination for listings, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of items returned.
    pub limit: usize,
    /// Number of items skipped.
    pub offset: usize,
}

impl Page {
    /// Validate a requested page. A missing limit means the default of 50.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if `limit` is outside `1..=200`.
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Result<Self, String> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(format!("limit must be between 1 and {MAX_PAGE_LIMIT}"));
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    /// Apply this page to an already sorted sequence.
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// Typed access to the storage backend.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
}

impl RecordStore {
    /// Wrap a storage backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Load and decode a record.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the read fails or the stored bytes do not
    /// decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RecordError> {
        Ok(self.get_versioned(key).await?.map(Versioned::into_inner))
    }

    /// Load a record along with its version for a later conditional write.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the read fails or the stored bytes do not
    /// decode as `T`.
    pub async fn get_versioned<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, RecordError> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(decode(key.to_owned(), raw)?)),
            None => Ok(None),
        }
    }

    /// Load and decode every record under `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the scan fails or any record does not
    /// decode as `T`.
    pub async fn scan<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<Versioned<T>>, RecordError> {
        self.backend
            .scan(prefix)
            .await?
            .into_iter()
            .map(|(key, raw)| decode(key, raw))
            .collect()
    }

    /// List the keys under `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Storage`] if the listing fails.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, RecordError> {
        Ok(self.backend.list(prefix).await?)
    }

    /// Atomically apply a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Conflict`] if any precondition no longer
    /// holds, or [`RecordError::Storage`] if the backend fails.
    pub async fn commit(&self, txn: Transaction) -> Result<(), RecordError> {
        Ok(self.backend.commit(txn.batch).await?)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(key: String, raw: Vec<u8>) -> Result<Versioned<T>, RecordError> {
    let value = serde_json::from_slice(&raw).map_err(|e| RecordError::Serialization {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    Ok(Versioned { key, value, raw })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, RecordError> {
    serde_json::to_vec(value).map_err(|e| RecordError::Serialization {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

/// A set of typed writes that commit together or not at all.
#[derive(Debug, Default)]
pub struct Transaction {
    batch: WriteBatch,
}

impl Transaction {
    /// Start an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialization`] if `value` cannot be encoded.
    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<&mut Self, RecordError> {
        let bytes = encode(key, value)?;
        self.batch.expect_absent(key).put(key, bytes);
        Ok(self)
    }

    /// Overwrite a record, provided it still holds the bytes `current` was
    /// read from.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialization`] if `value` cannot be encoded.
    pub fn replace<T: Serialize, U>(
        &mut self,
        current: &Versioned<U>,
        value: &T,
    ) -> Result<&mut Self, RecordError> {
        let bytes = encode(&current.key, value)?;
        self.batch
            .expect_value(current.key.clone(), current.raw.clone())
            .put(current.key.clone(), bytes);
        Ok(self)
    }

    /// Require that a record is unchanged since it was read, without
    /// writing it.
    pub fn require_unchanged<U>(&mut self, current: &Versioned<U>) -> &mut Self {
        self.batch
            .expect_value(current.key.clone(), current.raw.clone());
        self
    }

    /// Require that `key` does not exist, without writing it.
    pub fn require_absent(&mut self, key: &str) -> &mut Self {
        self.batch.expect_absent(key);
        self
    }

    /// Whether the transaction writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}
