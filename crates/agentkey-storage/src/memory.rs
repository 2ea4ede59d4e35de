//! In-memory storage backend.
//!
//! Stores all data in a `BTreeMap` behind a `RwLock`. Nothing persists past
//! process exit. Used by unit and integration tests, and by the server when
//! `AGENTKEY_STORAGE=memory`.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError, WriteBatch};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Data is sorted by key, which makes prefix listing a `BTreeMap::range`.
/// Commits take the write lock for their whole duration, so precondition
/// checks and writes are observed atomically by every other caller.
///
/// # Examples
///
/// ```
/// # use agentkey_storage::{MemoryBackend, StorageBackend, WriteBatch};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// let mut batch = WriteBatch::new();
/// batch.expect_absent("checkout/1").put("checkout/1", b"active".to_vec());
/// backend.commit(batch).await.unwrap();
/// assert_eq!(backend.get("checkout/1").await.unwrap(), Some(b"active".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let data = self.data.read().await;
        let entries = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(entries)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let (preconditions, writes) = batch.into_parts();
        let mut data = self.data.write().await;

        if let Some(failed) = preconditions
            .iter()
            .find(|p| !p.holds(data.get(&p.key).map(Vec::as_slice)))
        {
            return Err(StorageError::Conflict {
                key: failed.key.clone(),
            });
        }

        for (key, value) in writes {
            data.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("does/not/exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        assert_eq!(backend.get("key").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn list_and_scan_with_prefix() {
        let backend = MemoryBackend::new();
        backend.put("checkout/a", b"1").await.unwrap();
        backend.put("checkout/b", b"2").await.unwrap();
        backend.put("policy/a", b"3").await.unwrap();

        let keys = backend.list("checkout/").await.unwrap();
        assert_eq!(keys, vec!["checkout/a", "checkout/b"]);

        let entries = backend.scan("checkout/").await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("checkout/a".to_owned(), b"1".to_vec()),
                ("checkout/b".to_owned(), b"2".to_vec()),
            ]
        );
        assert!(backend.scan("secret/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_applies_all_writes() {
        let backend = MemoryBackend::new();
        let mut batch = WriteBatch::new();
        batch.put("a", b"1".to_vec()).put("b", b"2".to_vec());
        backend.commit(batch).await.unwrap();
        assert_eq!(backend.list("").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_precondition_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.put("state", b"returned").await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .expect_value("state", b"active".to_vec())
            .put("state", b"revoked".to_vec())
            .put("audit/1", b"record".to_vec());
        let err = backend.commit(batch).await.unwrap_err();

        assert!(matches!(err, StorageError::Conflict { ref key } if key == "state"));
        assert_eq!(backend.get("state").await.unwrap(), Some(b"returned".to_vec()));
        assert_eq!(backend.get("audit/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expect_absent_rejects_existing_key() {
        let backend = MemoryBackend::new();
        backend.put("label", b"x").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.expect_absent("label").put("label", b"y".to_vec());
        assert!(backend.commit(batch).await.unwrap_err().is_conflict());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_compare_and_swap_has_one_winner() {
        let backend = MemoryBackend::new();
        backend.put("state", b"active").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let mut batch = WriteBatch::new();
                batch
                    .expect_value("state", b"active".to_vec())
                    .put("state", vec![i]);
                backend.commit(batch).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("key", b"val").await.unwrap();
        assert_eq!(clone.get("key").await.unwrap(), Some(b"val".to_vec()));
    }
}
