//! Key-management boundary.
//!
//! Per-secret data keys never touch storage in the clear. They are wrapped
//! by a [`KeyManagement`] implementation that holds the master key on the
//! other side of a trust boundary. [`LocalKeyManager`] keeps that master key
//! in a local file, for development and single-host deployments, behind
//! the same trait a remote KMS client would implement.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey};
use crate::error::{CryptoError, KmsError};

/// HKDF info for the key that wraps data keys.
const WRAP_INFO: &[u8] = b"agentkey-kms-wrap-v1";

/// Associated data bound into every wrapped data key.
const WRAP_AAD: &[u8] = b"agentkey-data-key";

/// A data key encrypted under a master key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Identifier of the master key that wrapped this data key.
    pub key_id: String,
    /// `nonce || ciphertext || tag` of the data key.
    #[serde(with = "crypto::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Wraps and unwraps per-secret data keys.
///
/// Implementations must be safe to share across async tasks. Callers put
/// their own deadline around these calls; an implementation that talks to
/// a remote service should report outages as [`KmsError::Unavailable`].
#[async_trait::async_trait]
pub trait KeyManagement: Send + Sync + 'static {
    /// Identifier of the master key currently used for wrapping.
    fn key_id(&self) -> &str;

    /// Encrypt a data key under the master key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the key cannot be wrapped.
    async fn wrap(&self, data_key: &EncryptionKey) -> Result<WrappedKey, KmsError>;

    /// Recover a data key previously produced by [`wrap`](Self::wrap).
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::UnknownKey`] if the wrapped key names another
    /// master key, or [`KmsError::Unwrap`] if authentication fails.
    async fn unwrap(&self, wrapped: &WrappedKey) -> Result<EncryptionKey, KmsError>;
}

/// Master key held in a local file.
///
/// The file contains the hex-encoded 256-bit master key. The wrapping key is
/// derived from it with HKDF, and other purposes (such as the audit
/// fingerprint key) get their own subkeys via [`derive_subkey`](Self::derive_subkey).
pub struct LocalKeyManager {
    wrapping_key: EncryptionKey,
    master_key: EncryptionKey,
    key_id: String,
    path: Option<PathBuf>,
}

impl LocalKeyManager {
    /// Build a manager around an in-memory master key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Wrap`] if the wrapping key cannot be derived.
    pub fn from_master_key(master_key: EncryptionKey) -> Result<Self, KmsError> {
        let wrapping_key = crypto::derive_key(&master_key, None, WRAP_INFO).map_err(KmsError::Wrap)?;
        let digest = Sha256::digest(wrapping_key.as_bytes());
        let key_id = format!("local:{}", hex::encode(&digest[..8]));
        Ok(Self {
            wrapping_key,
            master_key,
            key_id,
            path: None,
        })
    }

    /// Load the master key from `path`, creating a fresh one if the file
    /// does not exist. New files are created with mode `0600` on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyFile`] if the file cannot be read, created, or
    /// does not contain a 32-byte hex key.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let path = path.as_ref();
        let key_file_error = |reason: String| KmsError::KeyFile {
            path: path.display().to_string(),
            reason,
        };

        let master_key = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let contents = Zeroizing::new(contents);
                let bytes = Zeroizing::new(
                    hex::decode(contents.trim()).map_err(|e| key_file_error(e.to_string()))?,
                );
                EncryptionKey::from_slice(&bytes).map_err(|e| key_file_error(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = EncryptionKey::generate();
                write_new_key_file(path, &key).map_err(|e| key_file_error(e.to_string()))?;
                info!(path = %path.display(), "generated new local master key");
                key
            }
            Err(e) => return Err(key_file_error(e.to_string())),
        };

        let mut manager = Self::from_master_key(master_key)?;
        manager.path = Some(path.to_path_buf());
        Ok(manager)
    }

    /// Derive a purpose-specific subkey from the master key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
    pub fn derive_subkey(&self, info: &[u8]) -> Result<EncryptionKey, CryptoError> {
        crypto::derive_key(&self.master_key, None, info)
    }
}

fn write_new_key_file(path: &Path, key: &EncryptionKey) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
    file.write_all(encoded.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[async_trait::async_trait]
impl KeyManagement for LocalKeyManager {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn wrap(&self, data_key: &EncryptionKey) -> Result<WrappedKey, KmsError> {
        let ciphertext =
            crypto::encrypt(&self.wrapping_key, data_key.as_bytes(), WRAP_AAD).map_err(KmsError::Wrap)?;
        Ok(WrappedKey {
            key_id: self.key_id.clone(),
            ciphertext,
        })
    }

    async fn unwrap(&self, wrapped: &WrappedKey) -> Result<EncryptionKey, KmsError> {
        if wrapped.key_id != self.key_id {
            return Err(KmsError::UnknownKey {
                key_id: wrapped.key_id.clone(),
            });
        }
        let bytes = Zeroizing::new(
            crypto::decrypt(&self.wrapping_key, &wrapped.ciphertext, WRAP_AAD)
                .map_err(KmsError::Unwrap)?,
        );
        EncryptionKey::from_slice(&bytes).map_err(KmsError::Unwrap)
    }
}

impl std::fmt::Debug for LocalKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyManager")
            .field("key_id", &self.key_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
