//! Shared application state for the Agent Key server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the broker and the few settings the
//! handlers consult directly.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use agentkey_core::audit::{AUDIT_HMAC_INFO, AuditSink};
use agentkey_core::audit_file::FileAuditSink;
use agentkey_core::broker::{Broker, BrokerOptions};
use agentkey_core::kms::LocalKeyManager;
use agentkey_storage::{MemoryBackend, StorageBackend};

use crate::config::{ServerConfig, StorageBackendType};

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The credential broker.
    pub broker: Broker,
    /// Whether `POST /v1/bootstrap` is served.
    pub bootstrap_enabled: bool,
    /// When the process started serving.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap an opened broker.
    #[must_use]
    pub fn new(broker: Broker, bootstrap_enabled: bool) -> Self {
        Self {
            broker,
            bootstrap_enabled,
            started_at: Utc::now(),
        }
    }

    /// Open storage, the master key, and the broker described by `config`.
    ///
    /// # Errors
    ///
    /// Fails if the storage backend or master key file cannot be opened, or
    /// if the broker refuses to open (for example a persisted checkout whose
    /// policy is missing).
    pub async fn open(config: &ServerConfig) -> anyhow::Result<Arc<Self>> {
        let storage = open_storage(&config.storage_backend)?;

        let kms = LocalKeyManager::load_or_create(&config.master_key_path)
            .with_context(|| format!("failed to load master key from {}", config.master_key_path))?;
        let audit_hmac_key = kms
            .derive_subkey(AUDIT_HMAC_INFO)
            .context("failed to derive audit fingerprint key")?;

        let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::new();
        if let Some(path) = &config.audit_file_path {
            info!(path = %path, "audit mirror enabled");
            sinks.push(Arc::new(FileAuditSink::new(path)));
        }

        let options = BrokerOptions {
            sinks,
            default_ttl_secs: config.default_checkout_ttl_secs,
            kms_timeout: config.kms_timeout,
            ..BrokerOptions::new(audit_hmac_key)
        };
        let broker = Broker::open(storage, Arc::new(kms), options)
            .await
            .context("failed to open broker")?;

        Ok(Arc::new(Self::new(broker, config.bootstrap_enabled)))
    }
}

fn open_storage(backend: &StorageBackendType) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match backend {
        StorageBackendType::Memory => {
            warn!("using in-memory storage (data will not persist)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Ok(Arc::new(
                agentkey_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            ))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB storage requested but the rocksdb-backend feature is disabled")
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bootstrap_enabled", &self.bootstrap_enabled)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_master_key_and_reuses_it() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("master.key");
        let config = ServerConfig {
            master_key_path: key_path.to_string_lossy().into_owned(),
            audit_file_path: Some(dir.path().join("audit.log").to_string_lossy().into_owned()),
            ..ServerConfig::from_lookup(|_| None)
        };

        let state = AppState::open(&config).await.unwrap();
        assert!(key_path.exists());
        let first = std::fs::read(&key_path).unwrap();

        state.broker.bootstrap("Acme", "root").await.unwrap();
        assert!(dir.path().join("audit.log").exists());

        AppState::open(&config).await.unwrap();
        assert_eq!(std::fs::read(&key_path).unwrap(), first);
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    #[tokio::test]
    async fn rocksdb_without_feature_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            master_key_path: dir.path().join("k").to_string_lossy().into_owned(),
            storage_backend: StorageBackendType::RocksDb {
                path: dir.path().join("db").to_string_lossy().into_owned(),
            },
            ..ServerConfig::from_lookup(|_| None)
        };
        assert!(AppState::open(&config).await.is_err());
    }
}
