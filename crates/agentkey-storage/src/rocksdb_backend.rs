//! `RocksDB` storage backend.
//!
//! Wraps the `rocksdb` crate behind the [`StorageBackend`] trait. All
//! operations are dispatched to a blocking thread via
//! [`tokio::task::spawn_blocking`] since `RocksDB` is a synchronous C++ library.
//!
//! Conditional commits are serialized by a process-local write lock: the
//! preconditions are read and the `WriteBatch` is applied while the lock is
//! held. This is sufficient because a database directory is opened by a
//! single process at a time (`RocksDB` holds a `LOCK` file).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rocksdb::{DBWithThreadMode, MultiThreaded, Options};

use crate::{StorageBackend, StorageError, WriteBatch};

type Db = DBWithThreadMode<MultiThreaded>;

/// A storage backend backed by `RocksDB`.
///
/// # Examples
///
/// ```no_run
/// # use agentkey_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/agentkey/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    write_lock: Arc<Mutex<()>>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` database at the given path, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open or create the
    /// database at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            path: path.to_path_buf(),
        })
    }

    /// Return the filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Iterate `prefix` in key order, collecting entries until the prefix ends.
fn scan_prefix(db: &Db, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let iter = db.iterator(rocksdb::IteratorMode::From(
        prefix.as_bytes(),
        rocksdb::Direction::Forward,
    ));

    let mut entries = Vec::new();
    for item in iter {
        let (k, v) = item.map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        })?;
        let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
            reason: e.to_string(),
        })?;
        if !key.starts_with(prefix) {
            break;
        }
        entries.push((key, v.to_vec()));
    }
    Ok(entries)
}

fn poisoned(e: &impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: format!("write lock poisoned: {e}"),
    }
}

fn join_failed(e: &tokio::task::JoinError) -> StorageError {
    StorageError::Transaction {
        reason: format!("blocking task panicked: {e}"),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes()).map_err(|e| StorageError::Read {
                key,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| join_failed(&e))?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let lock = Arc::clone(&self.write_lock);
        let key = key.to_owned();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().map_err(|e| poisoned(&e))?;
            db.put(key.as_bytes(), &value)
                .map_err(|e| StorageError::Write {
                    key,
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| join_failed(&e))?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.scan(prefix).await?;
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || scan_prefix(&db, &prefix))
            .await
            .map_err(|e| join_failed(&e))?
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().map_err(|e| poisoned(&e))?;
            let (preconditions, writes) = batch.into_parts();

            for precondition in &preconditions {
                let current = db.get(precondition.key.as_bytes()).map_err(|e| {
                    StorageError::Read {
                        key: precondition.key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if !precondition.holds(current.as_deref()) {
                    return Err(StorageError::Conflict {
                        key: precondition.key.clone(),
                    });
                }
            }

            let mut rocks_batch = rocksdb::WriteBatch::default();
            for (key, value) in &writes {
                rocks_batch.put(key.as_bytes(), value);
            }
            db.write(rocks_batch)
                .map_err(|e| StorageError::Transaction {
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| join_failed(&e))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksDbBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn put_get_and_scan() {
        let (_dir, backend) = open_temp();
        backend.put("checkout/a", b"1").await.unwrap();
        backend.put("checkout/b", b"2").await.unwrap();
        backend.put("secret/a", b"3").await.unwrap();

        assert_eq!(backend.get("checkout/a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            backend.list("checkout/").await.unwrap(),
            vec!["checkout/a", "checkout/b"]
        );
    }

    #[tokio::test]
    async fn conflicting_commit_is_rejected() {
        let (_dir, backend) = open_temp();
        backend.put("state", b"returned").await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .expect_value("state", b"active".to_vec())
            .put("state", b"revoked".to_vec());
        assert!(backend.commit(batch).await.unwrap_err().is_conflict());
        assert_eq!(backend.get("state").await.unwrap(), Some(b"returned".to_vec()));
    }
}
