//! Credential vault: envelope-encrypted upstream secrets.
//!
//! Each stored secret is encrypted under its own random data key with
//! AES-256-GCM, bound by associated data to the secret's id. The data key is
//! wrapped by the [`KeyManagement`] boundary and stored next to the
//! ciphertext. Plaintext is never persisted or logged; it exists only in a
//! zeroizing buffer returned from a reveal.
//!
//! Secrets are never deleted. Revocation sets `revoked_at`, after which the
//! secret is never revealed again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditActor, AuditLedger, AuditSubject, NewAuditRecord, SubjectKind};
use crate::clock::Clock;
use crate::crypto::{self, EncryptionKey};
use crate::error::{AuditError, KmsError, VaultError};
use crate::ids::{SecretId, ServiceId, TenantId};
use crate::kms::{KeyManagement, WrappedKey};
use crate::records::{MAX_COMMIT_ATTEMPTS, RecordStore, Transaction, Versioned};

const SECRET_PREFIX: &str = "secret/";
const LABEL_INDEX_PREFIX: &str = "secret-label/";
const SERVICE_INDEX_PREFIX: &str = "secret-by-service/";

/// Longest accepted label.
const MAX_LABEL_LEN: usize = 128;

/// A stored, encrypted upstream credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub id: SecretId,
    pub tenant: TenantId,
    pub service: ServiceId,
    pub label: String,
    /// `nonce || ciphertext || tag` under the data key.
    #[serde(with = "crypto::base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// The data key, wrapped by the key-management boundary.
    pub wrapped_key: WrappedKey,
    /// Incremented on every rotation.
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl StoredSecret {
    /// Whether the secret has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// What may be shown about a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub id: SecretId,
    pub service: ServiceId,
    pub label: String,
    pub key_id: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<&StoredSecret> for SecretMetadata {
    fn from(secret: &StoredSecret) -> Self {
        Self {
            id: secret.id,
            service: secret.service.clone(),
            label: secret.label.clone(),
            key_id: secret.wrapped_key.key_id.clone(),
            key_version: secret.key_version,
            created_at: secret.created_at,
            rotated_at: secret.rotated_at,
            revoked_at: secret.revoked_at,
        }
    }
}

/// Decrypted plaintext together with the record version it came from.
pub struct Revealed {
    plaintext: Zeroizing<Vec<u8>>,
    secret: Versioned<StoredSecret>,
}

impl Revealed {
    /// The plaintext. Do not log or persist it.
    #[must_use]
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// The record as it was when decrypted.
    #[must_use]
    pub fn secret(&self) -> &Versioned<StoredSecret> {
        &self.secret
    }

    /// Split into the plaintext and the record version.
    #[must_use]
    pub fn into_parts(self) -> (Zeroizing<Vec<u8>>, Versioned<StoredSecret>) {
        (self.plaintext, self.secret)
    }
}

impl std::fmt::Debug for Revealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revealed")
            .field("secret_id", &self.secret.value.id)
            .field("plaintext", &"[REDACTED]")
            .finish()
    }
}

fn secret_key(id: SecretId) -> String {
    format!("{SECRET_PREFIX}{id}")
}

fn label_key(tenant: TenantId, service: &ServiceId, label: &str) -> String {
    format!("{LABEL_INDEX_PREFIX}{tenant}/{service}/{}", hex::encode(label))
}

fn service_prefix(tenant: TenantId, service: &ServiceId) -> String {
    format!("{SERVICE_INDEX_PREFIX}{tenant}/{service}/")
}

fn aad(id: SecretId) -> Vec<u8> {
    format!("agentkey-secret:{id}").into_bytes()
}

/// Deposits, reveals, rotates, and revokes stored secrets.
#[derive(Clone)]
pub struct CredentialVault {
    records: RecordStore,
    ledger: Arc<dyn AuditLedger>,
    kms: Arc<dyn KeyManagement>,
    clock: Arc<dyn Clock>,
    kms_timeout: Duration,
}

impl CredentialVault {
    /// Create a vault. Every key-management call is bounded by `kms_timeout`.
    #[must_use]
    pub fn new(
        records: RecordStore,
        ledger: Arc<dyn AuditLedger>,
        kms: Arc<dyn KeyManagement>,
        clock: Arc<dyn Clock>,
        kms_timeout: Duration,
    ) -> Self {
        Self {
            records,
            ledger,
            kms,
            clock,
            kms_timeout,
        }
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, KmsError>>,
    ) -> Result<T, VaultError> {
        match tokio::time::timeout(self.kms_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VaultError::KmsTimeout {
                timeout_ms: u64::try_from(self.kms_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Encrypt `plaintext` under a fresh data key.
    async fn seal(
        &self,
        id: SecretId,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, WrappedKey), VaultError> {
        let data_key = EncryptionKey::generate();
        let ciphertext = crypto::encrypt(&data_key, plaintext, &aad(id))?;
        let wrapped_key = self.with_deadline(self.kms.wrap(&data_key)).await?;
        Ok((ciphertext, wrapped_key))
    }

    async fn open(&self, secret: &StoredSecret) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let data_key = self.with_deadline(self.kms.unwrap(&secret.wrapped_key)).await?;
        Ok(Zeroizing::new(crypto::decrypt(
            &data_key,
            &secret.ciphertext,
            &aad(secret.id),
        )?))
    }

    /// Encrypt and store an upstream credential.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Invalid`] if the plaintext is empty or the label is
    ///   empty or too long.
    /// - [`VaultError::DuplicateLabel`] if the service already has a secret
    ///   with this label.
    /// - [`VaultError::KmsTimeout`] / [`VaultError::Kms`] if the data key
    ///   cannot be wrapped.
    pub async fn deposit(
        &self,
        tenant: TenantId,
        service: ServiceId,
        plaintext: &[u8],
        label: &str,
        deposited_by: AuditActor,
    ) -> Result<SecretMetadata, VaultError> {
        if plaintext.is_empty() {
            return Err(VaultError::Invalid {
                reason: "secret value must not be empty".to_owned(),
            });
        }
        let label = label.trim();
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(VaultError::Invalid {
                reason: format!("label must be 1 to {MAX_LABEL_LEN} bytes"),
            });
        }

        let id = SecretId::new();
        let (ciphertext, wrapped_key) = self.seal(id, plaintext).await?;
        let now = self.clock.now();
        let secret = StoredSecret {
            id,
            tenant,
            service,
            label: label.to_owned(),
            ciphertext,
            wrapped_key,
            key_version: 1,
            created_at: now,
            rotated_at: None,
            revoked_at: None,
        };

        let mut txn = Transaction::new();
        txn.insert(&label_key(tenant, &secret.service, label), &id)?;
        txn.insert(&secret_key(id), &secret)?;
        txn.insert(
            &format!("{}{id}", service_prefix(tenant, &secret.service)),
            &id,
        )?;

        let entry = NewAuditRecord::succeeded(
            tenant,
            deposited_by,
            AuditAction::SecretDeposit,
            AuditSubject::new(SubjectKind::Secret, id),
            now,
        )
        .with_metadata(serde_json::json!({
            "service": secret.service,
            "label": secret.label,
            "key_id": secret.wrapped_key.key_id,
        }));

        match self.ledger.record(txn, entry).await {
            Ok(_) => {}
            Err(AuditError::Conflict { .. }) => {
                return Err(VaultError::DuplicateLabel {
                    service: secret.service.to_string(),
                    label: secret.label,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(secret_id = %id, service = %secret.service, "secret deposited");
        Ok(SecretMetadata::from(&secret))
    }

    async fn load(
        &self,
        tenant: TenantId,
        secret_id: SecretId,
    ) -> Result<Versioned<StoredSecret>, VaultError> {
        match self
            .records
            .get_versioned::<StoredSecret>(&secret_key(secret_id))
            .await?
        {
            Some(s) if s.value.tenant == tenant => Ok(s),
            _ => Err(VaultError::NotFound { secret_id }),
        }
    }

    /// Decrypt a stored secret.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the tenant has no such secret.
    /// - [`VaultError::Revoked`] if the secret has been revoked.
    /// - [`VaultError::KmsTimeout`] if the data key cannot be unwrapped in
    ///   time.
    pub async fn reveal(&self, tenant: TenantId, secret_id: SecretId) -> Result<Revealed, VaultError> {
        let secret = self.load(tenant, secret_id).await?;
        self.reveal_version(secret).await
    }

    /// Decrypt a secret record previously loaded with
    /// [`latest_active`](Self::latest_active).
    ///
    /// # Errors
    ///
    /// Same as [`reveal`](Self::reveal).
    pub async fn reveal_version(
        &self,
        secret: Versioned<StoredSecret>,
    ) -> Result<Revealed, VaultError> {
        if secret.value.is_revoked() {
            return Err(VaultError::Revoked {
                secret_id: secret.value.id,
            });
        }
        let started = std::time::Instant::now();
        let plaintext = self.open(&secret.value).await?;
        debug!(
            secret_id = %secret.value.id,
            elapsed_us = started.elapsed().as_micros(),
            "secret revealed"
        );
        Ok(Revealed { plaintext, secret })
    }

    /// Revoke a stored secret so that it is never revealed again.
    ///
    /// This blocks future checkouts only. Plaintext already handed out
    /// remains valid upstream until the credential is rotated or revoked at
    /// the provider; nothing here can recall it. Revoking an already
    /// revoked secret succeeds without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the tenant has no such secret.
    pub async fn revoke(
        &self,
        tenant: TenantId,
        secret_id: SecretId,
        revoked_by: AuditActor,
    ) -> Result<SecretMetadata, VaultError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(tenant, secret_id).await?;
            if current.value.is_revoked() {
                return Ok(SecretMetadata::from(&current.value));
            }

            let now = self.clock.now();
            let mut updated = current.value.clone();
            updated.revoked_at = Some(now);

            let mut txn = Transaction::new();
            txn.replace(&current, &updated)?;
            let entry = NewAuditRecord::succeeded(
                tenant,
                revoked_by,
                AuditAction::SecretRevoke,
                AuditSubject::new(SubjectKind::Secret, secret_id),
                now,
            )
            .with_metadata(serde_json::json!({ "service": updated.service }));

            match self.ledger.record(txn, entry).await {
                Ok(_) => {
                    info!(secret_id = %secret_id, "secret revoked");
                    return Ok(SecretMetadata::from(&updated));
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-encrypt a secret under a fresh data key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the tenant has no such secret.
    /// - [`VaultError::Revoked`] if the secret has been revoked.
    pub async fn rotate(
        &self,
        tenant: TenantId,
        secret_id: SecretId,
        rotated_by: AuditActor,
    ) -> Result<SecretMetadata, VaultError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(tenant, secret_id).await?;
            if current.value.is_revoked() {
                return Err(VaultError::Revoked { secret_id });
            }

            let plaintext = self.open(&current.value).await?;
            let (ciphertext, wrapped_key) = self.seal(secret_id, &plaintext).await?;
            let now = self.clock.now();
            let mut updated = current.value.clone();
            updated.ciphertext = ciphertext;
            updated.wrapped_key = wrapped_key;
            updated.key_version = updated.key_version.saturating_add(1);
            updated.rotated_at = Some(now);

            let mut txn = Transaction::new();
            txn.replace(&current, &updated)?;
            let entry = NewAuditRecord::succeeded(
                tenant,
                rotated_by,
                AuditAction::SecretRotate,
                AuditSubject::new(SubjectKind::Secret, secret_id),
                now,
            )
            .with_metadata(serde_json::json!({
                "key_version": updated.key_version,
                "key_id": updated.wrapped_key.key_id,
            }));

            match self.ledger.record(txn, entry).await {
                Ok(_) => {
                    info!(secret_id = %secret_id, key_version = updated.key_version, "secret rotated");
                    return Ok(SecretMetadata::from(&updated));
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The newest non-revoked secret the tenant holds for `service`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NoSecretForService`] if the tenant never deposited a
    ///   secret for the service.
    /// - [`VaultError::Revoked`] if every secret for the service is revoked.
    pub async fn latest_active(
        &self,
        tenant: TenantId,
        service: &ServiceId,
    ) -> Result<Versioned<StoredSecret>, VaultError> {
        let prefix = service_prefix(tenant, service);
        let mut newest_active: Option<Versioned<StoredSecret>> = None;
        let mut newest_revoked: Option<SecretId> = None;

        for id in self.records.scan::<SecretId>(&prefix).await? {
            let Some(secret) = self
                .records
                .get_versioned::<StoredSecret>(&secret_key(id.value))
                .await?
            else {
                continue;
            };
            if secret.value.is_revoked() {
                newest_revoked.get_or_insert(secret.value.id);
                continue;
            }
            let newer = newest_active
                .as_ref()
                .is_none_or(|best| secret.value.created_at > best.value.created_at);
            if newer {
                newest_active = Some(secret);
            }
        }

        match (newest_active, newest_revoked) {
            (Some(secret), _) => Ok(secret),
            (None, Some(secret_id)) => Err(VaultError::Revoked { secret_id }),
            (None, None) => Err(VaultError::NoSecretForService {
                service: service.to_string(),
            }),
        }
    }

    /// Metadata of one of the tenant's secrets.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the tenant has no such secret.
    pub async fn metadata(
        &self,
        tenant: TenantId,
        secret_id: SecretId,
    ) -> Result<SecretMetadata, VaultError> {
        Ok(SecretMetadata::from(&self.load(tenant, secret_id).await?.value))
    }

    /// Metadata of the tenant's secrets, optionally for one service, newest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Store`] if the store fails.
    pub async fn list(
        &self,
        tenant: TenantId,
        service: Option<&ServiceId>,
    ) -> Result<Vec<SecretMetadata>, VaultError> {
        let mut secrets: Vec<SecretMetadata> = self
            .records
            .scan::<StoredSecret>(SECRET_PREFIX)
            .await?
            .iter()
            .map(|s| &s.value)
            .filter(|s| s.tenant == tenant && service.is_none_or(|svc| *svc == s.service))
            .map(SecretMetadata::from)
            .collect();
        secrets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(secrets)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("kms_key_id", &self.kms.key_id())
            .field("kms_timeout", &self.kms_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use agentkey_storage::MemoryBackend;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::audit::{AuditFilter, StoreLedger};
    use crate::clock::ManualClock;
    use crate::kms::LocalKeyManager;

    struct Fixture {
        vault: CredentialVault,
        ledger: Arc<StoreLedger>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
    }

    async fn fixture_with(kms: Arc<dyn KeyManagement>, timeout: Duration) -> Fixture {
        let records = RecordStore::new(Arc::new(MemoryBackend::new()));
        let ledger = Arc::new(StoreLedger::open(records.clone(), Vec::new()).await.unwrap());
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        Fixture {
            vault: CredentialVault::new(records, ledger.clone(), kms, clock.clone(), timeout),
            ledger,
            clock,
            tenant: TenantId::new(),
        }
    }

    async fn fixture() -> Fixture {
        let kms = Arc::new(LocalKeyManager::from_master_key(EncryptionKey::generate()).unwrap());
        fixture_with(kms, Duration::from_secs(2)).await
    }

    fn openai() -> ServiceId {
        ServiceId::parse("openai").unwrap()
    }

    /// A key manager that never answers.
    struct HangingKms;

    #[async_trait::async_trait]
    impl KeyManagement for HangingKms {
        fn key_id(&self) -> &str {
            "hanging"
        }

        async fn wrap(&self, _data_key: &EncryptionKey) -> Result<WrappedKey, KmsError> {
            std::future::pending().await
        }

        async fn unwrap(&self, _wrapped: &WrappedKey) -> Result<EncryptionKey, KmsError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn deposit_then_reveal_returns_identical_bytes() {
        let f = fixture().await;
        let meta = f
            .vault
            .deposit(f.tenant, openai(), b"sk-live-abc", "prod", AuditActor::System)
            .await
            .unwrap();
        let revealed = f.vault.reveal(f.tenant, meta.id).await.unwrap();
        assert_eq!(revealed.plaintext(), b"sk-live-abc");
        assert!(!format!("{revealed:?}").contains("sk-live"));
    }

    #[tokio::test]
    async fn ciphertext_does_not_contain_plaintext() {
        let f = fixture().await;
        let meta = f
            .vault
            .deposit(f.tenant, openai(), b"sk-live-abc", "prod", AuditActor::System)
            .await
            .unwrap();
        let stored = f.vault.load(f.tenant, meta.id).await.unwrap();
        let raw = serde_json::to_string(&stored.value).unwrap();
        assert!(!raw.contains("sk-live-abc"));
    }

    #[tokio::test]
    async fn revoked_secret_is_never_revealed_and_revoke_is_idempotent() {
        let f = fixture().await;
        let meta = f
            .vault
            .deposit(f.tenant, openai(), b"sk", "prod", AuditActor::System)
            .await
            .unwrap();
        f.vault.revoke(f.tenant, meta.id, AuditActor::System).await.unwrap();
        f.vault.revoke(f.tenant, meta.id, AuditActor::System).await.unwrap();

        assert!(matches!(
            f.vault.reveal(f.tenant, meta.id).await,
            Err(VaultError::Revoked { .. })
        ));

        let revokes = f
            .ledger
            .query(
                f.tenant,
                &AuditFilter {
                    action: Some(AuditAction::SecretRevoke),
                    ..AuditFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(revokes.len(), 1);
    }

    #[tokio::test]
    async fn other_tenant_cannot_see_secret() {
        let f = fixture().await;
        let meta = f
            .vault
            .deposit(f.tenant, openai(), b"sk", "prod", AuditActor::System)
            .await
            .unwrap();
        assert!(matches!(
            f.vault.reveal(TenantId::new(), meta.id).await,
            Err(VaultError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn labels_are_unique_per_service() {
        let f = fixture().await;
        f.vault
            .deposit(f.tenant, openai(), b"a", "prod", AuditActor::System)
            .await
            .unwrap();
        assert!(matches!(
            f.vault
                .deposit(f.tenant, openai(), b"b", "prod", AuditActor::System)
                .await,
            Err(VaultError::DuplicateLabel { .. })
        ));
        f.vault
            .deposit(
                f.tenant,
                ServiceId::parse("stripe").unwrap(),
                b"c",
                "prod",
                AuditActor::System,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn latest_active_prefers_newest_unrevoked() {
        let f = fixture().await;
        assert!(matches!(
            f.vault.latest_active(f.tenant, &openai()).await,
            Err(VaultError::NoSecretForService { .. })
        ));

        let old = f
            .vault
            .deposit(f.tenant, openai(), b"old", "v1", AuditActor::System)
            .await
            .unwrap();
        f.clock.advance(ChronoDuration::seconds(10));
        let new = f
            .vault
            .deposit(f.tenant, openai(), b"new", "v2", AuditActor::System)
            .await
            .unwrap();

        let latest = f.vault.latest_active(f.tenant, &openai()).await.unwrap();
        assert_eq!(latest.value.id, new.id);

        f.vault.revoke(f.tenant, new.id, AuditActor::System).await.unwrap();
        let latest = f.vault.latest_active(f.tenant, &openai()).await.unwrap();
        assert_eq!(latest.value.id, old.id);

        f.vault.revoke(f.tenant, old.id, AuditActor::System).await.unwrap();
        assert!(matches!(
            f.vault.latest_active(f.tenant, &openai()).await,
            Err(VaultError::Revoked { .. })
        ));
    }

    #[tokio::test]
    async fn rotation_changes_data_key_not_plaintext() {
        let f = fixture().await;
        let meta = f
            .vault
            .deposit(f.tenant, openai(), b"sk-rotate", "prod", AuditActor::System)
            .await
            .unwrap();
        let before = f.vault.load(f.tenant, meta.id).await.unwrap();

        let rotated = f.vault.rotate(f.tenant, meta.id, AuditActor::System).await.unwrap();
        assert_eq!(rotated.key_version, 2);

        let after = f.vault.load(f.tenant, meta.id).await.unwrap();
        assert_ne!(before.value.wrapped_key, after.value.wrapped_key);
        assert_ne!(before.value.ciphertext, after.value.ciphertext);
        let revealed = f.vault.reveal(f.tenant, meta.id).await.unwrap();
        assert_eq!(revealed.plaintext(), b"sk-rotate");
    }

    #[tokio::test]
    async fn empty_values_and_labels_are_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.vault
                .deposit(f.tenant, openai(), b"", "prod", AuditActor::System)
                .await,
            Err(VaultError::Invalid { .. })
        ));
        assert!(matches!(
            f.vault
                .deposit(f.tenant, openai(), b"x", "  ", AuditActor::System)
                .await,
            Err(VaultError::Invalid { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_kms_times_out() {
        let f = fixture_with(Arc::new(HangingKms), Duration::from_millis(50)).await;
        let err = f
            .vault
            .deposit(f.tenant, openai(), b"x", "prod", AuditActor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::KmsTimeout { timeout_ms: 50 }));
        assert!(f.vault.list(f.tenant, None).await.unwrap().is_empty());
    }
}
