//! Error types for `agentkey-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. No variant ever includes key material or secret plaintext,
//! only identifiers and operation descriptions.
//!
//! The top-level enums ([`CheckoutError`], [`BrokerError`]) classify
//! themselves into an [`ErrorClass`] so callers can tell an expected denial
//! from a race, a retryable outage, or a broken invariant.

use agentkey_storage::StorageError;

use crate::checkout::CheckoutState;
use crate::ids::{CheckoutId, PolicyId, SecretId};
use crate::identity::Role;
use crate::policy_engine::DenialReason;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// An expected refusal under policy. Returned and audited, never retried.
    Denial,
    /// A race or misuse (already terminal, not the owner, duplicate name).
    Conflict,
    /// The referenced object does not exist for this caller.
    NotFound,
    /// The request itself is malformed.
    Invalid,
    /// Store or key-management unavailable. The only retryable class.
    Transient,
    /// Persisted state contradicts itself. Fatal for the operation.
    Invariant,
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, wrong AAD, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Raw key material had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// HMAC initialization failed.
    #[error("mac failed: {reason}")]
    Mac { reason: String },
}

/// Errors from the key-management boundary.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    /// The master key file could not be read or created.
    #[error("master key file '{path}': {reason}")]
    KeyFile { path: String, reason: String },

    /// A wrapped key names a master key this manager does not hold.
    #[error("unknown master key '{key_id}'")]
    UnknownKey { key_id: String },

    /// Wrapping a data key failed.
    #[error("wrap failed: {0}")]
    Wrap(#[source] CryptoError),

    /// Unwrapping a data key failed.
    #[error("unwrap failed: {0}")]
    Unwrap(#[source] CryptoError),

    /// The key-management service could not be reached.
    #[error("key management unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors from the typed record layer over the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// A record could not be encoded or decoded.
    #[error("record '{key}' serialization failed: {reason}")]
    Serialization { key: String, reason: String },

    /// A conditional commit lost an optimistic-concurrency race.
    #[error("concurrent modification of '{key}'")]
    Conflict { key: String },
}

impl From<StorageError> for RecordError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { key } => Self::Conflict { key },
            other => Self::Storage(other),
        }
    }
}

impl RecordError {
    /// Whether this error is a lost conditional commit.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(_) | Self::Conflict { .. } => ErrorClass::Transient,
            Self::Serialization { .. } => ErrorClass::Invariant,
        }
    }
}

/// Errors from the audit ledger and its mirror sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The state change committed with this record lost a race. Nothing
    /// was written, neither the state nor the record.
    #[error("audit commit conflicted on '{key}'")]
    Conflict { key: String },

    /// The ledger store failed. Nothing was written.
    #[error("audit store error: {0}")]
    Store(RecordError),

    /// An audit record could not be serialized for a sink.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// A mirror sink failed to write a committed record.
    #[error("audit sink '{name}' failed: {reason}")]
    Sink { name: String, reason: String },

    /// A query parameter was out of range.
    #[error("invalid audit query: {reason}")]
    InvalidQuery { reason: String },
}

impl From<RecordError> for AuditError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Conflict { key } => Self::Conflict { key },
            other => Self::Store(other),
        }
    }
}

impl AuditError {
    /// Whether the failed commit lost an optimistic-concurrency race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } | Self::Sink { .. } => ErrorClass::Transient,
            Self::Store(e) => e.class(),
            Self::Serialization { .. } => ErrorClass::Invariant,
            Self::InvalidQuery { .. } => ErrorClass::Invalid,
        }
    }
}

/// Errors from identity resolution and the token registry.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The presented credential is unknown, malformed, or revoked.
    #[error("invalid credential")]
    InvalidCredential,

    /// The named actor does not exist in this tenant.
    #[error("actor not found: {actor_id}")]
    NotFound { actor_id: String },

    /// An actor with this name and role already exists in the tenant.
    #[error("actor name '{name}' already in use")]
    NameTaken { name: String },

    /// A tenant already exists; bootstrap runs once.
    #[error("already bootstrapped")]
    AlreadyBootstrapped,

    /// Request validation failed.
    #[error("invalid identity request: {reason}")]
    Invalid { reason: String },

    /// The record store failed.
    #[error("identity store error: {0}")]
    Store(#[from] RecordError),

    /// The audit ledger refused the change.
    #[error("identity audit error: {0}")]
    Audit(#[from] AuditError),
}

impl IdentityError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidCredential => ErrorClass::Denial,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::NameTaken { .. } | Self::AlreadyBootstrapped => ErrorClass::Conflict,
            Self::Invalid { .. } => ErrorClass::Invalid,
            Self::Store(e) => e.class(),
            Self::Audit(e) => e.class(),
        }
    }
}

/// Errors from policy storage.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {policy_id}")]
    NotFound { policy_id: PolicyId },

    /// A policy already exists for this service and scope.
    #[error("policy already exists for service '{service}' and scope '{scope}'")]
    Duplicate { service: String, scope: String },

    /// The policy limits are invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The record store failed.
    #[error("policy store error: {0}")]
    Store(#[from] RecordError),

    /// The audit ledger refused the change.
    #[error("policy audit error: {0}")]
    Audit(#[from] AuditError),
}

impl PolicyError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Duplicate { .. } => ErrorClass::Conflict,
            Self::Invalid { .. } => ErrorClass::Invalid,
            Self::Store(e) => e.class(),
            Self::Audit(e) => e.class(),
        }
    }
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No stored secret with this id exists for the tenant.
    #[error("secret not found: {secret_id}")]
    NotFound { secret_id: SecretId },

    /// The tenant has no stored secret for the service.
    #[error("no stored secret for service '{service}'")]
    NoSecretForService { service: String },

    /// The stored secret has been revoked and will never be revealed again.
    #[error("secret revoked: {secret_id}")]
    Revoked { secret_id: SecretId },

    /// A secret with this label already exists for the service.
    #[error("label '{label}' already in use for service '{service}'")]
    DuplicateLabel { service: String, label: String },

    /// Request validation failed.
    #[error("invalid secret request: {reason}")]
    Invalid { reason: String },

    /// The key-management call exceeded its deadline.
    #[error("key management timed out after {timeout_ms}ms")]
    KmsTimeout { timeout_ms: u64 },

    /// The key-management boundary failed.
    #[error("key management error: {0}")]
    Kms(#[from] KmsError),

    /// Envelope encryption or decryption failed.
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The record store failed.
    #[error("vault store error: {0}")]
    Store(#[from] RecordError),

    /// The audit ledger refused the change.
    #[error("vault audit error: {0}")]
    Audit(#[from] AuditError),
}

impl VaultError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } | Self::NoSecretForService { .. } => ErrorClass::NotFound,
            Self::Revoked { .. } => ErrorClass::Denial,
            Self::DuplicateLabel { .. } => ErrorClass::Conflict,
            Self::Invalid { .. } => ErrorClass::Invalid,
            Self::KmsTimeout { .. } => ErrorClass::Transient,
            Self::Kms(e) => match e {
                KmsError::Unavailable { .. } => ErrorClass::Transient,
                _ => ErrorClass::Invariant,
            },
            Self::Crypto(_) => ErrorClass::Invariant,
            Self::Store(e) => e.class(),
            Self::Audit(e) => e.class(),
        }
    }
}

/// Errors from the checkout lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// The policy engine refused admission.
    #[error("checkout denied: {0}")]
    Denied(DenialReason),

    /// No checkout with this id exists for the caller's tenant.
    #[error("checkout not found: {checkout_id}")]
    NotFound { checkout_id: CheckoutId },

    /// The caller does not own the checkout.
    #[error("checkout {checkout_id} is owned by another actor")]
    NotOwner { checkout_id: CheckoutId },

    /// The checkout already left the `Active` state.
    #[error("checkout {checkout_id} is already {state}")]
    AlreadyTerminal {
        checkout_id: CheckoutId,
        state: CheckoutState,
    },

    /// The vault failed to produce the credential.
    #[error("checkout vault error: {0}")]
    Vault(#[from] VaultError),

    /// Policy lookup failed.
    #[error("checkout policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The record store failed.
    #[error("checkout store error: {0}")]
    Store(#[from] RecordError),

    /// The audit ledger refused the change.
    #[error("checkout audit error: {0}")]
    Audit(#[from] AuditError),

    /// Persisted checkout state contradicts itself.
    #[error("checkout invariant violated: {reason}")]
    Invariant { reason: String },
}

impl CheckoutError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Denied(_) => ErrorClass::Denial,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::NotOwner { .. } | Self::AlreadyTerminal { .. } => ErrorClass::Conflict,
            Self::Vault(e) => e.class(),
            Self::Policy(e) => e.class(),
            Self::Store(e) => e.class(),
            Self::Audit(e) => e.class(),
            Self::Invariant { .. } => ErrorClass::Invariant,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors surfaced by the [`Broker`](crate::broker::Broker) facade.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The caller's role does not permit the operation.
    #[error("operation requires the {required} role")]
    Forbidden { required: Role },

    /// Request validation failed at the facade.
    #[error("invalid request: {reason}")]
    Invalid { reason: String },

    /// A checkout lifecycle operation failed.
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    /// A vault operation failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// A policy operation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// An identity operation failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// An audit query failed.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// The key-management boundary failed while opening the broker.
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// The key for disclosure fingerprints could not be set up.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl BrokerError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Forbidden { .. } => ErrorClass::Denial,
            Self::Invalid { .. } => ErrorClass::Invalid,
            Self::Checkout(e) => e.class(),
            Self::Vault(e) => e.class(),
            Self::Policy(e) => e.class(),
            Self::Identity(e) => e.class(),
            Self::Audit(e) => e.class(),
            Self::Kms(_) | Self::Crypto(_) => ErrorClass::Invariant,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
