//! Server configuration for Agent Key.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `AGENTKEY_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8400;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Path of the JSON-lines audit mirror, if enabled.
    pub audit_file_path: Option<String>,
    /// Path of the local master key file.
    pub master_key_path: String,
    /// Checkout duration granted when a request names none.
    pub default_checkout_ttl_secs: i64,
    /// Upper bound on each key-management call.
    pub kms_timeout: Duration,
    /// Seconds between expiry sweeps. Zero disables the sweep.
    pub sweep_interval_secs: u64,
    /// Whether `POST /v1/bootstrap` is served.
    pub bootstrap_enabled: bool,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
}

fn flag(value: Option<String>, default: bool) -> bool {
    value.map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
    })
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on `0.0.0.0`
    /// - `AGENTKEY_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8400`)
    /// - `AGENTKEY_STORAGE`: `memory` or `rocksdb` (default: `memory`)
    /// - `AGENTKEY_STORAGE_PATH`: path for persistent backends (default: `./data`)
    /// - `AGENTKEY_LOG_LEVEL`: log filter when `RUST_LOG` is unset (default: `info`)
    /// - `AGENTKEY_AUDIT_FILE`: path of the audit mirror file (optional)
    /// - `AGENTKEY_MASTER_KEY_PATH`: master key file (default: `.agentkey_master.key`)
    /// - `AGENTKEY_DEFAULT_CHECKOUT_TTL`: seconds (default: `3600`)
    /// - `AGENTKEY_KMS_TIMEOUT_MS`: milliseconds (default: `2000`)
    /// - `AGENTKEY_SWEEP_INTERVAL`: seconds between expiry sweeps, `0` disables (default: `60`)
    /// - `AGENTKEY_BOOTSTRAP_ENABLED`: serve the bootstrap endpoint (default: `true`)
    /// - `AGENTKEY_DISABLE_MLOCK`: skip `mlockall` for dev environments (default: `false`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let default_addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
        let bind_addr = if let Some(addr) = var("AGENTKEY_BIND_ADDR") {
            addr.parse().unwrap_or(default_addr)
        } else if let Some(port) = var("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(DEFAULT_PORT)))
        } else {
            default_addr
        };

        let storage_path = var("AGENTKEY_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match var("AGENTKEY_STORAGE")
            .unwrap_or_else(|| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let default_checkout_ttl_secs = var("AGENTKEY_DEFAULT_CHECKOUT_TTL")
            .and_then(|v| v.parse().ok())
            .filter(|ttl: &i64| *ttl > 0)
            .unwrap_or(agentkey_core::broker::DEFAULT_CHECKOUT_TTL_SECS);

        let kms_timeout = var("AGENTKEY_KMS_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map_or(agentkey_core::broker::DEFAULT_KMS_TIMEOUT, Duration::from_millis);

        Self {
            bind_addr,
            storage_backend,
            log_level: var("AGENTKEY_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            audit_file_path: var("AGENTKEY_AUDIT_FILE").filter(|p| !p.is_empty()),
            master_key_path: var("AGENTKEY_MASTER_KEY_PATH")
                .unwrap_or_else(|| ".agentkey_master.key".to_owned()),
            default_checkout_ttl_secs,
            kms_timeout,
            sweep_interval_secs: var("AGENTKEY_SWEEP_INTERVAL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            bootstrap_enabled: flag(var("AGENTKEY_BOOTSTRAP_ENABLED"), true),
            disable_mlock: flag(var("AGENTKEY_DISABLE_MLOCK"), false),
        }
    }
}
