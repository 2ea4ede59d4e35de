//! Append-only audit ledger.
//!
//! Every state change is committed in the same storage transaction as the
//! audit record that describes it: callers hand the ledger their pending
//! [`Transaction`] and the ledger adds the record and commits both. If the
//! record cannot be written, the state change does not happen either.
//! Denied and failed attempts, which change no state, are recorded with an
//! empty transaction.
//!
//! Records are keyed `audit/<tenant>/<sequence>` with a zero-padded,
//! process-wide increasing sequence, and are only ever inserted.
//!
//! Committed records are additionally forwarded to optional [`AuditSink`]s
//! (for example a JSON-lines file). The store is the ledger of record; a
//! sink failure is logged and never undoes a commit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::EncryptionKey;
use crate::error::{AuditError, CryptoError};
use crate::identity::Role;
use crate::ids::{ActorId, TenantId};
use crate::records::{Page, RecordStore, Transaction};

type HmacSha256 = Hmac<Sha256>;

/// Key prefix of all audit records.
const AUDIT_PREFIX: &str = "audit/";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CheckoutIssue,
    CheckoutReturn,
    CheckoutRevoke,
    CheckoutExpire,
    SecretDeposit,
    SecretRevoke,
    SecretRotate,
    PolicyCreate,
    PolicyUpdate,
    TokenIssue,
    TokenRevoke,
    TenantBootstrap,
    /// A principal called an operation its role does not allow.
    AccessDenied,
}

impl AuditAction {
    /// The wire name of the action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckoutIssue => "checkout_issue",
            Self::CheckoutReturn => "checkout_return",
            Self::CheckoutRevoke => "checkout_revoke",
            Self::CheckoutExpire => "checkout_expire",
            Self::SecretDeposit => "secret_deposit",
            Self::SecretRevoke => "secret_revoke",
            Self::SecretRotate => "secret_rotate",
            Self::PolicyCreate => "policy_create",
            Self::PolicyUpdate => "policy_update",
            Self::TokenIssue => "token_issue",
            Self::TokenRevoke => "token_revoke",
            Self::TenantBootstrap => "tenant_bootstrap",
            Self::AccessDenied => "access_denied",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unknown audit action '{s}'"))
    }
}

/// Whether the attempted action took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The action was committed.
    Succeeded,
    /// Policy refused the action.
    Denied { reason: String },
    /// The action was attempted and failed.
    Failed { reason: String },
}

/// Who acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditActor {
    /// An authenticated administrator or agent.
    Principal { id: ActorId, role: Role },
    /// The broker itself (expiry reconciliation, bootstrap).
    System,
}

impl AuditActor {
    /// The actor id, if a principal acted.
    #[must_use]
    pub fn actor_id(&self) -> Option<ActorId> {
        match self {
            Self::Principal { id, .. } => Some(*id),
            Self::System => None,
        }
    }
}

/// The kind of object an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Checkout,
    Secret,
    Policy,
    Actor,
    Tenant,
    Service,
}

/// The object an audit record is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSubject {
    /// Kind of object.
    pub kind: SubjectKind,
    /// Identifier of the object.
    pub id: String,
}

impl AuditSubject {
    /// Build a subject from any displayable id.
    pub fn new(kind: SubjectKind, id: impl std::fmt::Display) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

/// An audit record before the ledger assigns its id and sequence.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub tenant: TenantId,
    pub actor: AuditActor,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub subject: AuditSubject,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NewAuditRecord {
    /// A successful action with empty metadata.
    #[must_use]
    pub fn succeeded(
        tenant: TenantId,
        actor: AuditActor,
        action: AuditAction,
        subject: AuditSubject,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant,
            actor,
            action,
            outcome: AuditOutcome::Succeeded,
            subject,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            timestamp,
        }
    }

    /// Mark the action as refused by policy.
    #[must_use]
    pub fn denied(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Denied {
            reason: reason.into(),
        };
        self
    }

    /// Mark the action as attempted but failed.
    #[must_use]
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failed {
            reason: reason.into(),
        };
        self
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An immutable, committed audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub tenant: TenantId,
    pub actor: AuditActor,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub subject: AuditSubject,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Query parameters for [`AuditLedger::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub actor: Option<ActorId>,
    pub subject_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: Page,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.action.is_none_or(|a| a == record.action)
            && self.actor.is_none_or(|a| record.actor.actor_id() == Some(a))
            && self
                .subject_id
                .as_ref()
                .is_none_or(|s| *s == record.subject.id)
            && self.since.is_none_or(|t| record.timestamp >= t)
            && self.until.is_none_or(|t| record.timestamp < t)
    }
}

/// The ledger contract: append with a state change, and read back.
#[async_trait::async_trait]
pub trait AuditLedger: Send + Sync + 'static {
    /// Commit `txn` together with an audit record describing it.
    ///
    /// Nothing is written unless both the state change and the record are.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Conflict`] if a precondition in `txn` no longer
    /// holds, or [`AuditError::Store`] if the store fails.
    async fn record(
        &self,
        txn: Transaction,
        entry: NewAuditRecord,
    ) -> Result<AuditRecord, AuditError>;

    /// Return the tenant's records matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if the store fails.
    async fn query(
        &self,
        tenant: TenantId,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>, AuditError>;
}

/// Receives a copy of every committed audit record.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name, for error reporting.
    fn name(&self) -> &str;

    /// Write one committed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Audit ledger stored in the same backend as the state it describes.
pub struct StoreLedger {
    records: RecordStore,
    next_sequence: AtomicU64,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl StoreLedger {
    /// Open the ledger, resuming the sequence after the highest stored one.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if existing records cannot be listed.
    pub async fn open(
        records: RecordStore,
        sinks: Vec<Arc<dyn AuditSink>>,
    ) -> Result<Self, AuditError> {
        let last = records
            .keys(AUDIT_PREFIX)
            .await?
            .iter()
            .filter_map(|key| key.rsplit('/').next()?.parse::<u64>().ok())
            .max();
        let next = last.map_or(1, |seq| seq.saturating_add(1));
        debug!(next_sequence = next, "audit ledger opened");
        Ok(Self {
            records,
            next_sequence: AtomicU64::new(next),
            sinks,
        })
    }

    async fn mirror(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(record).await {
                warn!(
                    sink = sink.name(),
                    sequence = record.sequence,
                    error = %e,
                    "audit sink failed"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl AuditLedger for StoreLedger {
    async fn record(
        &self,
        mut txn: Transaction,
        entry: NewAuditRecord,
    ) -> Result<AuditRecord, AuditError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = AuditRecord {
            id: Uuid::new_v4(),
            sequence,
            tenant: entry.tenant,
            actor: entry.actor,
            action: entry.action,
            outcome: entry.outcome,
            subject: entry.subject,
            metadata: entry.metadata,
            timestamp: entry.timestamp,
        };

        let key = format!("{AUDIT_PREFIX}{}/{sequence:020}", record.tenant);
        txn.insert(&key, &record)?;
        self.records.commit(txn).await?;

        debug!(
            sequence,
            action = %record.action,
            subject = %record.subject.id,
            "audit record committed"
        );
        self.mirror(&record).await;
        Ok(record)
    }

    async fn query(
        &self,
        tenant: TenantId,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let prefix = format!("{AUDIT_PREFIX}{tenant}/");
        let records = self.records.scan::<AuditRecord>(&prefix).await?;
        let matching = records
            .into_iter()
            .rev()
            .map(|v| v.value)
            .filter(|r| filter.matches(r));
        Ok(filter.page.apply(matching))
    }
}

impl std::fmt::Debug for StoreLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLedger")
            .field("next_sequence", &self.next_sequence)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

/// HKDF info for deriving the fingerprint key from a master key.
pub const AUDIT_HMAC_INFO: &[u8] = b"agentkey-audit-hmac-v1";

/// Keyed fingerprints of disclosed material.
///
/// An HMAC-SHA256 over the plaintext lets an investigator confirm which
/// secret value a checkout disclosed without the ledger storing it.
pub struct Fingerprinter {
    key: EncryptionKey,
}

impl Fingerprinter {
    /// Create a fingerprinter with a dedicated key.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Hex-encoded HMAC-SHA256 of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Mac`] if the HMAC cannot be keyed.
    pub fn fingerprint(&self, data: &[u8]) -> Result<String, CryptoError> {
        let mut mac =
            HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| CryptoError::Mac {
                reason: e.to_string(),
            })?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use agentkey_storage::MemoryBackend;
    use chrono::Duration;

    use super::*;
    use crate::records::Versioned;

    fn records() -> RecordStore {
        RecordStore::new(Arc::new(MemoryBackend::new()))
    }

    fn entry(tenant: TenantId, action: AuditAction, at: DateTime<Utc>) -> NewAuditRecord {
        NewAuditRecord::succeeded(
            tenant,
            AuditActor::System,
            action,
            AuditSubject::new(SubjectKind::Tenant, tenant),
            at,
        )
    }

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl AuditSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Sink {
                    name: "collect".to_owned(),
                    reason: "disk full".to_owned(),
                });
            }
            self.seen.lock().unwrap().push(record.sequence);
            Ok(())
        }
    }

    #[tokio::test]
    async fn record_commits_state_and_entry_together() {
        let records = records();
        let ledger = StoreLedger::open(records.clone(), Vec::new()).await.unwrap();
        let tenant = TenantId::new();

        let mut txn = Transaction::new();
        txn.insert("thing/1", &"state").unwrap();
        let committed = ledger
            .record(txn, entry(tenant, AuditAction::PolicyCreate, Utc::now()))
            .await
            .unwrap();

        assert_eq!(committed.sequence, 1);
        assert_eq!(
            records.get::<String>("thing/1").await.unwrap().as_deref(),
            Some("state")
        );
        let found = ledger.query(tenant, &AuditFilter::default()).await.unwrap();
        assert_eq!(found, vec![committed]);
    }

    #[tokio::test]
    async fn conflicting_state_writes_no_record() {
        let records = records();
        let ledger = StoreLedger::open(records.clone(), Vec::new()).await.unwrap();
        let tenant = TenantId::new();

        let mut txn = Transaction::new();
        txn.insert("thing/1", &1).unwrap();
        ledger
            .record(txn, entry(tenant, AuditAction::PolicyCreate, Utc::now()))
            .await
            .unwrap();

        let mut txn = Transaction::new();
        txn.insert("thing/1", &2).unwrap();
        let err = ledger
            .record(txn, entry(tenant, AuditAction::PolicyCreate, Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let all = ledger.query(tenant, &AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let ledger = StoreLedger::open(records(), Vec::new()).await.unwrap();
        let tenant = TenantId::new();
        let other = TenantId::new();
        let t0 = Utc::now();

        for (i, action) in [
            AuditAction::CheckoutIssue,
            AuditAction::CheckoutReturn,
            AuditAction::CheckoutIssue,
        ]
        .into_iter()
        .enumerate()
        {
            let at = t0 + Duration::seconds(i64::try_from(i).unwrap());
            ledger
                .record(Transaction::new(), entry(tenant, action, at))
                .await
                .unwrap();
        }
        ledger
            .record(Transaction::new(), entry(other, AuditAction::CheckoutIssue, t0))
            .await
            .unwrap();

        let issues = ledger
            .query(
                tenant,
                &AuditFilter {
                    action: Some(AuditAction::CheckoutIssue),
                    ..AuditFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].sequence > issues[1].sequence);

        let since = ledger
            .query(
                tenant,
                &AuditFilter {
                    since: Some(t0 + Duration::seconds(1)),
                    ..AuditFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[tokio::test]
    async fn sequence_resumes_after_reopen() {
        let records = records();
        let tenant = TenantId::new();
        let ledger = StoreLedger::open(records.clone(), Vec::new()).await.unwrap();
        for _ in 0..3 {
            ledger
                .record(Transaction::new(), entry(tenant, AuditAction::TokenIssue, Utc::now()))
                .await
                .unwrap();
        }

        let reopened = StoreLedger::open(records.clone(), Vec::new()).await.unwrap();
        let next = reopened
            .record(Transaction::new(), entry(tenant, AuditAction::TokenIssue, Utc::now()))
            .await
            .unwrap();
        assert_eq!(next.sequence, 4);

        let stored: Vec<Versioned<AuditRecord>> = records.scan("audit/").await.unwrap();
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn sinks_receive_records_and_failures_do_not_undo_commits() {
        let good = Arc::new(CollectingSink::default());
        let bad = Arc::new(CollectingSink {
            fail: true,
            ..CollectingSink::default()
        });
        let ledger = StoreLedger::open(
            records(),
            vec![good.clone() as Arc<dyn AuditSink>, bad as Arc<dyn AuditSink>],
        )
        .await
        .unwrap();
        let tenant = TenantId::new();

        let committed = ledger
            .record(Transaction::new(), entry(tenant, AuditAction::SecretDeposit, Utc::now()))
            .await
            .unwrap();
        assert_eq!(*good.seen.lock().unwrap(), vec![committed.sequence]);
        assert_eq!(
            ledger.query(tenant, &AuditFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[test]
    fn fingerprints_are_keyed() {
        let key = EncryptionKey::generate();
        let a = Fingerprinter::new(key.clone());
        let b = Fingerprinter::new(EncryptionKey::generate());
        assert_eq!(
            a.fingerprint(b"sk-123").unwrap(),
            Fingerprinter::new(key).fingerprint(b"sk-123").unwrap()
        );
        assert_ne!(a.fingerprint(b"sk-123").unwrap(), b.fingerprint(b"sk-123").unwrap());
        assert_eq!(a.fingerprint(b"x").unwrap().len(), 64);
    }

    #[test]
    fn actions_parse_from_wire_names() {
        let action: AuditAction = "checkout_expire".parse().unwrap();
        assert_eq!(action, AuditAction::CheckoutExpire);
        assert_eq!(action.to_string(), "checkout_expire");
        assert!("nope".parse::<AuditAction>().is_err());
    }
}
