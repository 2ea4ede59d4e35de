//! Checkout policies.
//!
//! A policy governs admission for one service within a tenant, either for
//! every actor of the tenant or for one specific actor. At most one policy
//! exists per (tenant, service, scope); the scope index key enforces that
//! with an insert-if-absent in the same commit as the policy itself.
//!
//! Resolution is an explicit two-step lookup returning
//! [`EffectivePolicy`]: the actor-specific policy if there is one, else the
//! tenant-wide one, else nothing (which the engine treats as a denial). A
//! disabled actor-specific policy still wins over an enabled tenant-wide
//! one, so an administrator can switch a single agent off.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditAction, AuditActor, AuditLedger, AuditSubject, NewAuditRecord, SubjectKind};
use crate::clock::Clock;
use crate::error::{AuditError, PolicyError};
use crate::ids::{ActorId, PolicyId, ServiceId, TenantId};
use crate::records::{MAX_COMMIT_ATTEMPTS, RecordStore, Transaction, Versioned};

const POLICY_PREFIX: &str = "policy/";
const SCOPE_INDEX_PREFIX: &str = "policy-scope/";

/// Default issuance limit per window.
pub const DEFAULT_MAX_CHECKOUTS_PER_WINDOW: u32 = 100;
/// Default concurrency cap.
pub const DEFAULT_MAX_ACTIVE: u32 = 1;
/// Default maximum checkout duration, in seconds.
pub const DEFAULT_MAX_TTL_SECS: i64 = 3600;
/// Shortest allowed maximum checkout duration, in seconds.
pub const MIN_MAX_TTL_SECS: i64 = 60;
/// Longest allowed maximum checkout duration, in seconds (365 days).
pub const MAX_MAX_TTL_SECS: i64 = 365 * 86_400;

/// Length of the issuance-rate window.
///
/// Windows are fixed and aligned to the Unix epoch (an hourly window resets
/// on the hour, UTC). An actor can therefore issue up to twice the limit in
/// a short burst straddling a boundary; fixed windows are used because they
/// need one counter per scope and reset deterministically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    /// One hour.
    Hourly,
    /// One day (UTC).
    #[default]
    Daily,
    /// An arbitrary number of seconds.
    Seconds(u64),
}

impl RateWindow {
    /// Window length in seconds.
    #[must_use]
    pub fn length_secs(self) -> u64 {
        match self {
            Self::Hourly => 3600,
            Self::Daily => 86_400,
            Self::Seconds(n) => n,
        }
    }
}

/// Who a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyScope {
    /// Every actor of the tenant.
    Tenant,
    /// One actor.
    Actor { actor: ActorId },
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant => f.write_str("tenant"),
            Self::Actor { actor } => write!(f, "actor-{actor}"),
        }
    }
}

/// A persisted checkout policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub tenant: TenantId,
    pub scope: PolicyScope,
    pub service: ServiceId,
    /// Issuances allowed per window.
    pub max_checkouts_per_window: u32,
    pub window: RateWindow,
    /// Checkouts allowed to be `Active` at once.
    pub max_active: u32,
    /// Longest checkout granted, in seconds.
    pub max_ttl_secs: i64,
    /// `true` shortens over-long requests to `max_ttl_secs`; `false`
    /// denies them with `TtlExceedsMax`.
    pub clamp_ttl: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new policy. Unset limits take the defaults (100 per
/// day, 1 active, 3600 s, clamping, enabled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPolicy {
    pub scope: PolicyScope,
    pub service: ServiceId,
    pub max_checkouts_per_window: u32,
    pub window: RateWindow,
    pub max_active: u32,
    pub max_ttl_secs: i64,
    pub clamp_ttl: bool,
    pub enabled: bool,
}

impl NewPolicy {
    /// A tenant-wide policy with default limits.
    #[must_use]
    pub fn tenant_wide(service: ServiceId) -> Self {
        Self {
            scope: PolicyScope::Tenant,
            service,
            max_checkouts_per_window: DEFAULT_MAX_CHECKOUTS_PER_WINDOW,
            window: RateWindow::default(),
            max_active: DEFAULT_MAX_ACTIVE,
            max_ttl_secs: DEFAULT_MAX_TTL_SECS,
            clamp_ttl: true,
            enabled: true,
        }
    }

    /// An actor-specific policy with default limits.
    #[must_use]
    pub fn for_actor(service: ServiceId, actor: ActorId) -> Self {
        Self {
            scope: PolicyScope::Actor { actor },
            ..Self::tenant_wide(service)
        }
    }
}

/// A partial change to a policy's limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyUpdate {
    pub max_checkouts_per_window: Option<u32>,
    pub window: Option<RateWindow>,
    pub max_active: Option<u32>,
    pub max_ttl_secs: Option<i64>,
    pub clamp_ttl: Option<bool>,
    pub enabled: Option<bool>,
}

impl PolicyUpdate {
    fn apply(&self, policy: &mut Policy) {
        if let Some(v) = self.max_checkouts_per_window {
            policy.max_checkouts_per_window = v;
        }
        if let Some(v) = self.window {
            policy.window = v;
        }
        if let Some(v) = self.max_active {
            policy.max_active = v;
        }
        if let Some(v) = self.max_ttl_secs {
            policy.max_ttl_secs = v;
        }
        if let Some(v) = self.clamp_ttl {
            policy.clamp_ttl = v;
        }
        if let Some(v) = self.enabled {
            policy.enabled = v;
        }
    }
}

/// The policy that governs a request, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectivePolicy {
    /// A policy written for this actor.
    ActorSpecific(Policy),
    /// The tenant's policy for the service.
    TenantWide(Policy),
}

impl EffectivePolicy {
    /// Borrow the resolved policy.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        match self {
            Self::ActorSpecific(p) | Self::TenantWide(p) => p,
        }
    }

    /// Take the resolved policy.
    #[must_use]
    pub fn into_policy(self) -> Policy {
        match self {
            Self::ActorSpecific(p) | Self::TenantWide(p) => p,
        }
    }
}

fn validate_limits(
    max_checkouts_per_window: u32,
    window: RateWindow,
    max_active: u32,
    max_ttl_secs: i64,
) -> Result<(), PolicyError> {
    let invalid = |reason: &str| {
        Err(PolicyError::Invalid {
            reason: reason.to_owned(),
        })
    };
    if max_checkouts_per_window == 0 {
        return invalid("max_checkouts_per_window must be at least 1");
    }
    if window.length_secs() == 0 {
        return invalid("window must be at least 1 second");
    }
    if max_active == 0 {
        return invalid("max_active must be at least 1");
    }
    if max_ttl_secs < MIN_MAX_TTL_SECS {
        return invalid("max_ttl_secs must be at least 60");
    }
    if max_ttl_secs > MAX_MAX_TTL_SECS {
        return invalid("max_ttl_secs must be at most 31536000 (365 days)");
    }
    Ok(())
}

fn policy_key(id: PolicyId) -> String {
    format!("{POLICY_PREFIX}{id}")
}

fn scope_key(tenant: TenantId, service: &ServiceId, scope: PolicyScope) -> String {
    format!("{SCOPE_INDEX_PREFIX}{tenant}/{service}/{scope}")
}

/// Persists policies and resolves the effective one for a request.
#[derive(Clone)]
pub struct PolicyStore {
    records: RecordStore,
    ledger: Arc<dyn AuditLedger>,
    clock: Arc<dyn Clock>,
}

impl PolicyStore {
    /// Create a policy store over the shared record store.
    #[must_use]
    pub fn new(records: RecordStore, ledger: Arc<dyn AuditLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records,
            ledger,
            clock,
        }
    }

    /// Create a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Invalid`] if a limit is out of range.
    /// - [`PolicyError::Duplicate`] if the tenant already has a policy for
    ///   this service and scope.
    pub async fn create(
        &self,
        tenant: TenantId,
        new: NewPolicy,
        created_by: AuditActor,
    ) -> Result<Policy, PolicyError> {
        validate_limits(
            new.max_checkouts_per_window,
            new.window,
            new.max_active,
            new.max_ttl_secs,
        )?;

        let now = self.clock.now();
        let policy = Policy {
            id: PolicyId::new(),
            tenant,
            scope: new.scope,
            service: new.service,
            max_checkouts_per_window: new.max_checkouts_per_window,
            window: new.window,
            max_active: new.max_active,
            max_ttl_secs: new.max_ttl_secs,
            clamp_ttl: new.clamp_ttl,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };

        let mut txn = Transaction::new();
        txn.insert(&scope_key(tenant, &policy.service, policy.scope), &policy.id)?;
        txn.insert(&policy_key(policy.id), &policy)?;

        let entry = NewAuditRecord::succeeded(
            tenant,
            created_by,
            AuditAction::PolicyCreate,
            AuditSubject::new(SubjectKind::Policy, policy.id),
            now,
        )
        .with_metadata(serde_json::json!({ "policy": &policy }));

        match self.ledger.record(txn, entry).await {
            Ok(_) => {}
            Err(AuditError::Conflict { .. }) => {
                return Err(PolicyError::Duplicate {
                    service: policy.service.to_string(),
                    scope: policy.scope.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            policy_id = %policy.id,
            service = %policy.service,
            scope = %policy.scope,
            "policy created"
        );
        Ok(policy)
    }

    /// Patch a policy's limits or enabled flag.
    ///
    /// Changes apply to future admissions only; checkouts already issued
    /// keep the expiry they were granted.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if the tenant has no such policy.
    /// - [`PolicyError::Invalid`] if the patched limits are out of range.
    pub async fn update(
        &self,
        tenant: TenantId,
        policy_id: PolicyId,
        update: &PolicyUpdate,
        updated_by: AuditActor,
    ) -> Result<Policy, PolicyError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(tenant, policy_id).await?;
            let mut updated = current.value.clone();
            update.apply(&mut updated);
            validate_limits(
                updated.max_checkouts_per_window,
                updated.window,
                updated.max_active,
                updated.max_ttl_secs,
            )?;
            let now = self.clock.now();
            updated.updated_at = now;

            let mut txn = Transaction::new();
            txn.replace(&current, &updated)?;
            let entry = NewAuditRecord::succeeded(
                tenant,
                updated_by,
                AuditAction::PolicyUpdate,
                AuditSubject::new(SubjectKind::Policy, policy_id),
                now,
            )
            .with_metadata(serde_json::json!({ "before": &current.value, "after": &updated }));

            match self.ledger.record(txn, entry).await {
                Ok(_) => {
                    info!(policy_id = %policy_id, enabled = updated.enabled, "policy updated");
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load(
        &self,
        tenant: TenantId,
        policy_id: PolicyId,
    ) -> Result<Versioned<Policy>, PolicyError> {
        match self
            .records
            .get_versioned::<Policy>(&policy_key(policy_id))
            .await?
        {
            Some(p) if p.value.tenant == tenant => Ok(p),
            _ => Err(PolicyError::NotFound { policy_id }),
        }
    }

    /// Load a policy by id regardless of tenant.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the store fails.
    pub async fn get(&self, policy_id: PolicyId) -> Result<Option<Policy>, PolicyError> {
        Ok(self.records.get(&policy_key(policy_id)).await?)
    }

    /// Load one of the tenant's policies.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if the tenant has no such policy.
    pub async fn get_for_tenant(
        &self,
        tenant: TenantId,
        policy_id: PolicyId,
    ) -> Result<Policy, PolicyError> {
        Ok(self.load(tenant, policy_id).await?.into_inner())
    }

    /// The tenant's policies, optionally for one service, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the store fails.
    pub async fn list(
        &self,
        tenant: TenantId,
        service: Option<&ServiceId>,
    ) -> Result<Vec<Policy>, PolicyError> {
        let mut policies: Vec<Policy> = self
            .records
            .scan::<Policy>(POLICY_PREFIX)
            .await?
            .into_iter()
            .map(Versioned::into_inner)
            .filter(|p| p.tenant == tenant && service.is_none_or(|s| *s == p.service))
            .collect();
        policies.sort_by_key(|p| p.created_at);
        Ok(policies)
    }

    /// Resolve the policy governing `actor`'s access to `service`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the store fails.
    pub async fn resolve(
        &self,
        tenant: TenantId,
        actor: ActorId,
        service: &ServiceId,
    ) -> Result<Option<EffectivePolicy>, PolicyError> {
        if let Some(policy) = self
            .lookup_scope(tenant, service, PolicyScope::Actor { actor })
            .await?
        {
            return Ok(Some(EffectivePolicy::ActorSpecific(policy)));
        }
        Ok(self
            .lookup_scope(tenant, service, PolicyScope::Tenant)
            .await?
            .map(EffectivePolicy::TenantWide))
    }

    async fn lookup_scope(
        &self,
        tenant: TenantId,
        service: &ServiceId,
        scope: PolicyScope,
    ) -> Result<Option<Policy>, PolicyError> {
        let Some(policy_id) = self
            .records
            .get::<PolicyId>(&scope_key(tenant, service, scope))
            .await?
        else {
            return Ok(None);
        };
        Ok(self.records.get(&policy_key(policy_id)).await?)
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use agentkey_storage::MemoryBackend;

    use super::*;
    use crate::audit::{AuditFilter, StoreLedger};
    use crate::clock::ManualClock;

    async fn store() -> (PolicyStore, Arc<StoreLedger>) {
        let records = RecordStore::new(Arc::new(MemoryBackend::new()));
        let ledger = Arc::new(StoreLedger::open(records.clone(), Vec::new()).await.unwrap());
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        (PolicyStore::new(records, ledger.clone(), clock), ledger)
    }

    fn openai() -> ServiceId {
        ServiceId::parse("openai").unwrap()
    }

    #[tokio::test]
    async fn actor_specific_policy_wins() {
        let (store, _) = store().await;
        let tenant = TenantId::new();
        let actor = ActorId::new();
        let by = AuditActor::System;

        assert!(store.resolve(tenant, actor, &openai()).await.unwrap().is_none());

        let wide = store
            .create(tenant, NewPolicy::tenant_wide(openai()), by)
            .await
            .unwrap();
        let resolved = store.resolve(tenant, actor, &openai()).await.unwrap();
        assert_eq!(resolved, Some(EffectivePolicy::TenantWide(wide)));

        let mut specific = NewPolicy::for_actor(openai(), actor);
        specific.max_active = 3;
        let specific = store.create(tenant, specific, by).await.unwrap();
        let resolved = store.resolve(tenant, actor, &openai()).await.unwrap();
        assert_eq!(resolved, Some(EffectivePolicy::ActorSpecific(specific)));

        let other = store
            .resolve(tenant, ActorId::new(), &openai())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(other, EffectivePolicy::TenantWide(_)));
    }

    #[tokio::test]
    async fn duplicate_scope_is_rejected() {
        let (store, _) = store().await;
        let tenant = TenantId::new();
        store
            .create(tenant, NewPolicy::tenant_wide(openai()), AuditActor::System)
            .await
            .unwrap();
        let err = store
            .create(tenant, NewPolicy::tenant_wide(openai()), AuditActor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Duplicate { .. }));

        store
            .create(TenantId::new(), NewPolicy::tenant_wide(openai()), AuditActor::System)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limits_are_validated() {
        let (store, _) = store().await;
        let tenant = TenantId::new();

        let mut short = NewPolicy::tenant_wide(openai());
        short.max_ttl_secs = 59;
        assert!(matches!(
            store.create(tenant, short, AuditActor::System).await,
            Err(PolicyError::Invalid { .. })
        ));

        let mut zero = NewPolicy::tenant_wide(openai());
        zero.window = RateWindow::Seconds(0);
        assert!(matches!(
            store.create(tenant, zero, AuditActor::System).await,
            Err(PolicyError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn unbounded_max_ttl_is_rejected() {
        let (store, _) = store().await;
        let tenant = TenantId::new();

        let mut huge = NewPolicy::tenant_wide(openai());
        huge.max_ttl_secs = i64::MAX;
        assert!(matches!(
            store.create(tenant, huge, AuditActor::System).await,
            Err(PolicyError::Invalid { .. })
        ));

        let mut year = NewPolicy::tenant_wide(openai());
        year.max_ttl_secs = MAX_MAX_TTL_SECS;
        let policy = store.create(tenant, year, AuditActor::System).await.unwrap();

        let patched = store
            .update(
                tenant,
                policy.id,
                &PolicyUpdate {
                    max_ttl_secs: Some(MAX_MAX_TTL_SECS + 1),
                    ..PolicyUpdate::default()
                },
                AuditActor::System,
            )
            .await;
        assert!(matches!(patched, Err(PolicyError::Invalid { .. })));
    }

    #[tokio::test]
    async fn update_patches_and_audits() {
        let (store, ledger) = store().await;
        let tenant = TenantId::new();
        let policy = store
            .create(tenant, NewPolicy::tenant_wide(openai()), AuditActor::System)
            .await
            .unwrap();

        let updated = store
            .update(
                tenant,
                policy.id,
                &PolicyUpdate {
                    enabled: Some(false),
                    window: Some(RateWindow::Hourly),
                    ..PolicyUpdate::default()
                },
                AuditActor::System,
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.window, RateWindow::Hourly);
        assert_eq!(updated.max_active, policy.max_active);

        let bad = store
            .update(
                tenant,
                policy.id,
                &PolicyUpdate {
                    max_active: Some(0),
                    ..PolicyUpdate::default()
                },
                AuditActor::System,
            )
            .await;
        assert!(matches!(bad, Err(PolicyError::Invalid { .. })));

        let missing = store
            .update(
                TenantId::new(),
                policy.id,
                &PolicyUpdate::default(),
                AuditActor::System,
            )
            .await;
        assert!(matches!(missing, Err(PolicyError::NotFound { .. })));

        let actions: Vec<AuditAction> = ledger
            .query(tenant, &AuditFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::PolicyUpdate, AuditAction::PolicyCreate]);
    }

    #[test]
    fn rate_window_wire_format() {
        assert_eq!(serde_json::to_string(&RateWindow::Hourly).unwrap(), "\"hourly\"");
        let custom: RateWindow = serde_json::from_str(r#"{"seconds":30}"#).unwrap();
        assert_eq!(custom.length_secs(), 30);
    }
}
