//! Cryptographic primitives for Agent Key.
//!
//! Provides AES-256-GCM authenticated encryption with associated data,
//! HKDF-SHA256 key derivation, and zeroize-on-drop key newtypes. All key
//! material is cleared from memory when dropped.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Associated data binds a ciphertext to the record it belongs to, so a
//!   ciphertext copied onto another record fails authentication.
//! - Key derivation uses HKDF-SHA256 with a unique `info` per purpose.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = 12 + 16;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Length of a 256-bit key.
pub const KEY_LEN: usize = 32;

/// A 256-bit encryption key that is zeroized on drop.
///
/// Used for master keys, per-secret data keys, and derived subkeys. The
/// inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, checking its length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is exactly
    /// 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce, binding
/// `aad` into the authentication tag.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt ciphertext produced by [`encrypt`] with the same `aad`.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes (nonce + tag minimum).
///
/// Returns [`CryptoError::Decryption`] if authentication fails (wrong key,
/// wrong associated data, corrupted data, or tampered tag).
pub fn decrypt(key: &EncryptionKey, combined: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Derive a purpose-specific key from a root key using HKDF-SHA256.
///
/// The `info` string must be unique per purpose (e.g.
/// `b"agentkey-kms-wrap-v1"`, `b"agentkey-audit-hmac-v1"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root_key.as_bytes());
    let mut derived = [0u8; KEY_LEN];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Serde adapter that stores byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from base64.
    ///
    /// # Errors
    ///
    /// Fails if the input is not a valid base64 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"sk-live-123", b"secret/a").unwrap();
        let decrypted = decrypt(&key, &ciphertext, b"secret/a").unwrap();
        assert_eq!(decrypted, b"sk-live-123");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"sk-live-123", b"secret/a").unwrap();
        let result = decrypt(&key, &ciphertext, b"secret/b");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn wrong_key_fails() {
        let ciphertext = encrypt(&EncryptionKey::generate(), b"secret", b"").unwrap();
        assert!(decrypt(&EncryptionKey::generate(), &ciphertext, b"").is_err());
    }

    #[test]
    fn too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, &[0u8; 10], b"");
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut ciphertext = encrypt(&key, b"secret", b"aad").unwrap();
        if let Some(byte) = ciphertext.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        assert!(matches!(
            decrypt(&key, &ciphertext, b"aad"),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn derivation_is_deterministic_and_purpose_bound() {
        let root = EncryptionKey::generate();
        let a1 = derive_key(&root, None, b"purpose-a").unwrap();
        let a2 = derive_key(&root, None, b"purpose-a").unwrap();
        let b = derive_key(&root, None, b"purpose-b").unwrap();
        assert_eq!(a1.as_bytes(), a2.as_bytes());
        assert_ne!(a1.as_bytes(), b.as_bytes());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }

    #[test]
    fn random_bytes_differ() {
        assert_eq!(random_bytes(24).len(), 24);
        assert_ne!(random_bytes(24), random_bytes(24));
    }
}
