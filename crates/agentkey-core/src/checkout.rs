//! Checkout lifecycle.
//!
//! A checkout is a time-bound record that an actor took possession of a
//! stored secret. It is not an upstream lease: once the plaintext leaves,
//! nothing here can recall it.
//!
//! ```text
//!            ┌──► Returned
//!   Active ──┼──► Expired
//!            └──► Revoked
//! ```
//!
//! Exactly one terminal transition applies. Every transition is a
//! conditional replace of the record as it was read, committed together with
//! its audit record, so concurrent return and revoke resolve first writer
//! wins and the loser sees [`CheckoutError::AlreadyTerminal`].
//!
//! Expiry is evaluated lazily. [`CheckoutState::Active`] with
//! `expires_at <= now` is reported as expired everywhere, and the first
//! reader that needs the slot (a new checkout, `list_active`, a return, or
//! the background sweep) persists the transition and releases the quota.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::audit::{
    AuditAction, AuditActor, AuditLedger, AuditSubject, Fingerprinter, NewAuditRecord, SubjectKind,
};
use crate::clock::Clock;
use crate::error::{CheckoutError, VaultError};
use crate::identity::Identity;
use crate::ids::{ActorId, CheckoutId, PolicyId, ReservationId, SecretId, ServiceId, TenantId};
use crate::policy::{EffectivePolicy, PolicyStore};
use crate::policy_engine::{Admission, Decision, PolicyEngine};
use crate::quota::{QuotaScope, RestoredCheckout};
use crate::records::{MAX_COMMIT_ATTEMPTS, Page, RecordStore, Transaction, Versioned};
use crate::vault::CredentialVault;

const CHECKOUT_PREFIX: &str = "checkout/";
const OPEN_SET_PREFIX: &str = "open-checkouts/";

/// Lifecycle state of a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    Active,
    Returned,
    Expired,
    Revoked,
}

impl CheckoutState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// The wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Returned => "returned",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted checkout record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: CheckoutId,
    pub tenant: TenantId,
    pub actor: ActorId,
    pub service: ServiceId,
    pub secret_id: SecretId,
    /// The policy evaluated at issuance.
    pub policy_id: PolicyId,
    /// The quota reservation this checkout holds while active.
    pub reservation: ReservationId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    /// The persisted state. Use [`effective_state`](Self::effective_state)
    /// for what a caller should see.
    pub state: CheckoutState,
}

impl Checkout {
    /// The state as of `now`, treating an overdue active checkout as
    /// expired.
    #[must_use]
    pub fn effective_state(&self, now: DateTime<Utc>) -> CheckoutState {
        match self.state {
            CheckoutState::Active if now >= self.expires_at => CheckoutState::Expired,
            state => state,
        }
    }

    /// Whether the record is still active but its time has run out.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == CheckoutState::Active && now >= self.expires_at
    }

    /// The quota scope the checkout's reservation was taken in.
    #[must_use]
    pub fn quota_scope(&self) -> QuotaScope {
        QuotaScope {
            tenant: self.tenant,
            actor: self.actor,
            service: self.service.clone(),
            policy: self.policy_id,
        }
    }
}

/// What callers are shown about a checkout. Never carries plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    pub id: CheckoutId,
    pub actor: ActorId,
    pub service: ServiceId,
    pub secret_id: SecretId,
    pub policy_id: PolicyId,
    pub state: CheckoutState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl CheckoutSummary {
    /// Summarize `checkout` as observed at `now`.
    #[must_use]
    pub fn observed(checkout: &Checkout, now: DateTime<Utc>) -> Self {
        Self {
            id: checkout.id,
            actor: checkout.actor,
            service: checkout.service.clone(),
            secret_id: checkout.secret_id,
            policy_id: checkout.policy_id,
            state: checkout.effective_state(now),
            issued_at: checkout.issued_at,
            expires_at: checkout.expires_at,
            returned_at: checkout.returned_at,
            revoked_at: checkout.revoked_at,
            expired_at: checkout
                .expired_at
                .or_else(|| checkout.is_overdue(now).then_some(checkout.expires_at)),
        }
    }
}

/// A committed checkout and the plaintext it discloses.
pub struct CheckoutGrant {
    pub checkout: Checkout,
    pub granted_ttl_secs: i64,
    plaintext: Zeroizing<Vec<u8>>,
}

impl CheckoutGrant {
    /// The disclosed credential. Do not log or persist it.
    #[must_use]
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }
}

impl fmt::Debug for CheckoutGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckoutGrant")
            .field("checkout", &self.checkout)
            .field("granted_ttl_secs", &self.granted_ttl_secs)
            .field("plaintext", &"[REDACTED]")
            .finish()
    }
}

fn checkout_key(id: CheckoutId) -> String {
    format!("{CHECKOUT_PREFIX}{id}")
}

fn open_set_key(actor: ActorId) -> String {
    format!("{OPEN_SET_PREFIX}{actor}")
}

/// Ids of one actor's checkouts that are still persisted as active.
///
/// Issue adds the id and every terminal transition removes it, each in the
/// same commit as the checkout record, so the set stays as small as the
/// actor's live checkouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct OpenSet {
    ids: Vec<CheckoutId>,
}

impl OpenSet {
    fn with(&self, id: CheckoutId) -> Self {
        let mut ids = self.ids.clone();
        ids.push(id);
        Self { ids }
    }

    fn without(&self, id: CheckoutId) -> Self {
        Self {
            ids: self.ids.iter().copied().filter(|open| *open != id).collect(),
        }
    }
}

fn newest_first(checkouts: &mut [Checkout]) {
    checkouts.sort_by(|a, b| {
        b.issued_at
            .cmp(&a.issued_at)
            .then_with(|| b.id.as_uuid().cmp(&a.id.as_uuid()))
    });
}

/// The terminal transition being applied.
#[derive(Debug, Clone, Copy)]
enum Transition {
    Return,
    Revoke,
    Expire,
}

impl Transition {
    fn action(self) -> AuditAction {
        match self {
            Self::Return => AuditAction::CheckoutReturn,
            Self::Revoke => AuditAction::CheckoutRevoke,
            Self::Expire => AuditAction::CheckoutExpire,
        }
    }

    fn apply(self, checkout: &mut Checkout, now: DateTime<Utc>) {
        match self {
            Self::Return => {
                checkout.state = CheckoutState::Returned;
                checkout.returned_at = Some(now);
            }
            Self::Revoke => {
                checkout.state = CheckoutState::Revoked;
                checkout.revoked_at = Some(now);
            }
            Self::Expire => {
                checkout.state = CheckoutState::Expired;
                checkout.expired_at = Some(checkout.expires_at);
            }
        }
    }
}

/// Owns the checkout state machine.
#[derive(Clone)]
pub struct CheckoutManager {
    records: RecordStore,
    ledger: Arc<dyn AuditLedger>,
    vault: CredentialVault,
    engine: PolicyEngine,
    policies: PolicyStore,
    clock: Arc<dyn Clock>,
    fingerprinter: Arc<Fingerprinter>,
}

impl CheckoutManager {
    /// Create a manager over the given components.
    #[must_use]
    pub fn new(
        records: RecordStore,
        ledger: Arc<dyn AuditLedger>,
        vault: CredentialVault,
        engine: PolicyEngine,
        policies: PolicyStore,
        clock: Arc<dyn Clock>,
        fingerprinter: Arc<Fingerprinter>,
    ) -> Self {
        Self {
            records,
            ledger,
            vault,
            engine,
            policies,
            clock,
            fingerprinter,
        }
    }

    /// Check out the caller's credential for `service`.
    ///
    /// Expired checkouts of the caller are reconciled first so that their
    /// slots count as free. On approval the newest non-revoked secret for
    /// the service is revealed, and the active checkout is committed
    /// together with its audit record on the condition that the secret was
    /// not revoked or rotated in between. Any failure after admission rolls
    /// the quota reservation back and records a failed attempt.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Denied`] if the policy engine refuses; the denial
    ///   is audited.
    /// - [`CheckoutError::Vault`] if no usable secret exists or it cannot be
    ///   decrypted.
    /// - [`CheckoutError::Audit`] / [`CheckoutError::Store`] if the commit
    ///   fails.
    pub async fn checkout(
        &self,
        identity: &Identity,
        service: &ServiceId,
        requested_ttl_secs: i64,
    ) -> Result<CheckoutGrant, CheckoutError> {
        let now = self.clock.now();
        if let Err(err) = self
            .reconcile_actor(identity.tenant, identity.actor, now)
            .await
        {
            self.record_failed_issue(identity, service, now, &err).await;
            return Err(err);
        }

        let decision = match self
            .engine
            .evaluate(
                identity.tenant,
                identity.actor,
                service,
                requested_ttl_secs,
                now,
            )
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                let err = CheckoutError::from(e);
                self.record_failed_issue(identity, service, now, &err).await;
                return Err(err);
            }
        };

        let admission = match decision {
            Decision::Approved(admission) => admission,
            Decision::Denied(reason) => {
                let entry = NewAuditRecord::succeeded(
                    identity.tenant,
                    identity.audit_actor(),
                    AuditAction::CheckoutIssue,
                    AuditSubject::new(SubjectKind::Service, service),
                    now,
                )
                .denied(reason.as_str())
                .with_metadata(serde_json::json!({
                    "service": service,
                    "requested_ttl_secs": requested_ttl_secs,
                }));
                self.ledger.record(Transaction::new(), entry).await?;
                info!(
                    actor_id = %identity.actor,
                    service = %service,
                    reason = %reason,
                    "checkout denied"
                );
                return Err(CheckoutError::Denied(reason));
            }
        };

        match self
            .issue(identity, service, requested_ttl_secs, &admission)
            .await
        {
            Ok(grant) => Ok(grant),
            Err(err) => {
                self.engine.tracker().rollback(&admission.reservation);
                warn!(
                    actor_id = %identity.actor,
                    service = %service,
                    error = %err,
                    "checkout failed after admission, reservation rolled back"
                );
                self.record_failed_issue(identity, service, now, &err).await;
                Err(err)
            }
        }
    }

    async fn issue(
        &self,
        identity: &Identity,
        service: &ServiceId,
        requested_ttl_secs: i64,
        admission: &Admission,
    ) -> Result<CheckoutGrant, CheckoutError> {
        let policy = admission.policy.policy();
        let policy_scope = match admission.policy {
            EffectivePolicy::ActorSpecific(_) => "actor",
            EffectivePolicy::TenantWide(_) => "tenant",
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let secret = self.vault.latest_active(identity.tenant, service).await?;
            let (plaintext, secret) = self.vault.reveal_version(secret).await?.into_parts();
            let fingerprint = self
                .fingerprinter
                .fingerprint(&plaintext)
                .map_err(VaultError::from)?;

            let checkout = Checkout {
                id: CheckoutId::new(),
                tenant: identity.tenant,
                actor: identity.actor,
                service: service.clone(),
                secret_id: secret.value.id,
                policy_id: policy.id,
                reservation: admission.reservation.id,
                issued_at: admission.issued_at,
                expires_at: admission.expires_at,
                returned_at: None,
                revoked_at: None,
                expired_at: None,
                state: CheckoutState::Active,
            };

            let open_key = open_set_key(checkout.actor);
            let open = self.records.get_versioned::<OpenSet>(&open_key).await?;

            let mut txn = Transaction::new();
            txn.insert(&checkout_key(checkout.id), &checkout)?;
            match &open {
                Some(current) => txn.replace(current, &current.value.with(checkout.id))?,
                None => txn.insert(&open_key, &OpenSet::default().with(checkout.id))?,
            };
            txn.require_unchanged(&secret);

            let entry = NewAuditRecord::succeeded(
                identity.tenant,
                identity.audit_actor(),
                AuditAction::CheckoutIssue,
                AuditSubject::new(SubjectKind::Checkout, checkout.id),
                admission.issued_at,
            )
            .with_metadata(serde_json::json!({
                "service": service,
                "secret_id": checkout.secret_id,
                "policy_id": checkout.policy_id,
                "policy_scope": policy_scope,
                "requested_ttl_secs": requested_ttl_secs,
                "granted_ttl_secs": admission.granted_ttl_secs,
                "expires_at": checkout.expires_at,
                "fingerprint": fingerprint,
            }));

            match self.ledger.record(txn, entry).await {
                Ok(_) => {
                    info!(
                        checkout_id = %checkout.id,
                        actor_id = %checkout.actor,
                        service = %checkout.service,
                        secret_id = %checkout.secret_id,
                        expires_at = %checkout.expires_at,
                        "checkout issued"
                    );
                    return Ok(CheckoutGrant {
                        checkout,
                        granted_ttl_secs: admission.granted_ttl_secs,
                        plaintext,
                    });
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        attempt,
                        service = %service,
                        "secret or open checkouts changed during checkout, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_failed_issue(
        &self,
        identity: &Identity,
        service: &ServiceId,
        now: DateTime<Utc>,
        err: &CheckoutError,
    ) {
        let entry = NewAuditRecord::succeeded(
            identity.tenant,
            identity.audit_actor(),
            AuditAction::CheckoutIssue,
            AuditSubject::new(SubjectKind::Service, service),
            now,
        )
        .failed(err.to_string())
        .with_metadata(serde_json::json!({ "service": service }));
        if let Err(audit_err) = self.ledger.record(Transaction::new(), entry).await {
            error!(
                actor_id = %identity.actor,
                service = %service,
                error = %audit_err,
                "failed to audit failed checkout"
            );
        }
    }

    async fn record_refusal(
        &self,
        identity: &Identity,
        action: AuditAction,
        checkout_id: CheckoutId,
        err: &CheckoutError,
    ) {
        let entry = NewAuditRecord::succeeded(
            identity.tenant,
            identity.audit_actor(),
            action,
            AuditSubject::new(SubjectKind::Checkout, checkout_id),
            self.clock.now(),
        )
        .failed(err.to_string());
        if let Err(audit_err) = self.ledger.record(Transaction::new(), entry).await {
            error!(
                actor_id = %identity.actor,
                checkout_id = %checkout_id,
                action = %action,
                error = %audit_err,
                "failed to audit refused checkout transition"
            );
        }
    }

    async fn load(
        &self,
        tenant: TenantId,
        checkout_id: CheckoutId,
    ) -> Result<Versioned<Checkout>, CheckoutError> {
        match self
            .records
            .get_versioned::<Checkout>(&checkout_key(checkout_id))
            .await?
        {
            Some(c) if c.value.tenant == tenant => Ok(c),
            _ => Err(CheckoutError::NotFound { checkout_id }),
        }
    }

    /// Apply `transition` to `current` and commit it with its audit record.
    ///
    /// Returns `None` if the record or the actor's open set changed since it
    /// was read; the caller reloads and decides again.
    async fn transition(
        &self,
        current: &Versioned<Checkout>,
        transition: Transition,
        by: AuditActor,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkout>, CheckoutError> {
        let mut updated = current.value.clone();
        transition.apply(&mut updated, now);

        let mut txn = Transaction::new();
        txn.replace(current, &updated)?;
        let open = self
            .records
            .get_versioned::<OpenSet>(&open_set_key(updated.actor))
            .await?;
        if let Some(open) = open.filter(|o| o.value.ids.contains(&updated.id)) {
            txn.replace(&open, &open.value.without(updated.id))?;
        }
        let entry = NewAuditRecord::succeeded(
            updated.tenant,
            by,
            transition.action(),
            AuditSubject::new(SubjectKind::Checkout, updated.id),
            now,
        )
        .with_metadata(serde_json::json!({
            "actor_id": updated.actor,
            "service": updated.service,
            "secret_id": updated.secret_id,
            "issued_at": updated.issued_at,
            "expires_at": updated.expires_at,
        }));

        match self.ledger.record(txn, entry).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if !self
            .engine
            .tracker()
            .release(&updated.quota_scope(), updated.reservation)
        {
            debug!(checkout_id = %updated.id, "reservation already released");
        }
        info!(
            checkout_id = %updated.id,
            actor_id = %updated.actor,
            state = %updated.state,
            "checkout closed"
        );
        Ok(Some(updated))
    }

    /// Persist the expiry of an overdue checkout. Returns whether this call
    /// made the transition.
    ///
    /// A lost race against a concurrent issue for the same actor only
    /// touched the open set, so the checkout is reloaded and retried while
    /// it is still active.
    async fn expire(
        &self,
        current: &Versioned<Checkout>,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckoutError> {
        let mut current = current.clone();
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            if self
                .transition(&current, Transition::Expire, AuditActor::System, now)
                .await?
                .is_some()
            {
                return Ok(true);
            }
            match self
                .records
                .get_versioned::<Checkout>(&checkout_key(current.value.id))
                .await?
            {
                Some(reloaded) if reloaded.value.state == CheckoutState::Active => {
                    current = reloaded;
                }
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Shared body of return and revoke. Every refusal or failure is audited
    /// against the checkout before it is returned.
    async fn close(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
        transition: Transition,
        require_owner: bool,
    ) -> Result<CheckoutSummary, CheckoutError> {
        match self
            .try_close(identity, checkout_id, transition, require_owner)
            .await
        {
            Ok(summary) => Ok(summary),
            Err(err) => {
                debug!(checkout_id = %checkout_id, error = %err, "checkout transition refused");
                self.record_refusal(identity, transition.action(), checkout_id, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn try_close(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
        transition: Transition,
        require_owner: bool,
    ) -> Result<CheckoutSummary, CheckoutError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(identity.tenant, checkout_id).await?;
            if require_owner && current.value.actor != identity.actor {
                return Err(CheckoutError::NotOwner { checkout_id });
            }

            let now = self.clock.now();
            if current.value.is_overdue(now) {
                self.expire(&current, now).await?;
            }
            let state = current.value.effective_state(now);
            if state.is_terminal() {
                return Err(CheckoutError::AlreadyTerminal { checkout_id, state });
            }

            match self
                .transition(&current, transition, identity.audit_actor(), now)
                .await?
            {
                Some(updated) => return Ok(CheckoutSummary::observed(&updated, now)),
                None if attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(checkout_id = %checkout_id, attempt, "checkout changed, reloading");
                }
                None => {
                    return Err(CheckoutError::Invariant {
                        reason: format!(
                            "checkout {checkout_id} kept changing across {MAX_COMMIT_ATTEMPTS} attempts"
                        ),
                    });
                }
            }
        }
    }

    /// Return an active checkout early. Only the owning actor may return.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] if the tenant has no such checkout.
    /// - [`CheckoutError::NotOwner`] if the caller is not the owner.
    /// - [`CheckoutError::AlreadyTerminal`] if the checkout was already
    ///   returned, revoked, or has expired.
    pub async fn return_checkout(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
    ) -> Result<CheckoutSummary, CheckoutError> {
        self.close(identity, checkout_id, Transition::Return, true)
            .await
    }

    /// Revoke an active checkout on an administrator's behalf.
    ///
    /// This blocks nothing upstream: the disclosed credential stays usable
    /// until rotated at the provider. It frees the actor's slot and marks the
    /// record revoked, distinct from expiry.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] if the tenant has no such checkout.
    /// - [`CheckoutError::AlreadyTerminal`] if the checkout already left the
    ///   active state.
    pub async fn revoke_checkout(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
    ) -> Result<CheckoutSummary, CheckoutError> {
        self.close(identity, checkout_id, Transition::Revoke, false)
            .await
    }

    /// The actor's checkouts still persisted as active. Reads only the open
    /// set, never the actor's history.
    async fn open_checkouts(
        &self,
        actor: ActorId,
    ) -> Result<Vec<Versioned<Checkout>>, CheckoutError> {
        let Some(open) = self.records.get::<OpenSet>(&open_set_key(actor)).await? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(open.ids.len());
        for id in open.ids {
            match self
                .records
                .get_versioned::<Checkout>(&checkout_key(id))
                .await?
            {
                Some(checkout) => out.push(checkout),
                None => {
                    error!(checkout_id = %id, actor_id = %actor, "open checkout is missing");
                    return Err(CheckoutError::Invariant {
                        reason: format!("open checkout {id} is missing"),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Persist the expiry of the actor's overdue checkouts and release their
    /// slots. Returns how many this call expired.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Store`] / [`CheckoutError::Audit`] if the
    /// store fails.
    pub async fn reconcile_actor(
        &self,
        tenant: TenantId,
        actor: ActorId,
        now: DateTime<Utc>,
    ) -> Result<usize, CheckoutError> {
        let mut expired = 0;
        for checkout in self.open_checkouts(actor).await? {
            if checkout.value.tenant == tenant
                && checkout.value.is_overdue(now)
                && self.expire(&checkout, now).await?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(actor_id = %actor, expired, "reconciled expired checkouts");
        }
        Ok(expired)
    }

    /// The caller's active checkouts, newest first, after reconciling
    /// expired ones.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Store`] / [`CheckoutError::Audit`] if the
    /// store fails.
    pub async fn list_active(
        &self,
        identity: &Identity,
    ) -> Result<Vec<CheckoutSummary>, CheckoutError> {
        let now = self.clock.now();
        self.reconcile_actor(identity.tenant, identity.actor, now)
            .await?;
        let mut active: Vec<Checkout> = self
            .open_checkouts(identity.actor)
            .await?
            .into_iter()
            .map(Versioned::into_inner)
            .filter(|c| c.tenant == identity.tenant && c.effective_state(now) == CheckoutState::Active)
            .collect();
        newest_first(&mut active);
        Ok(active
            .iter()
            .map(|c| CheckoutSummary::observed(c, now))
            .collect())
    }

    /// Expire every overdue checkout across all tenants. Returns how many
    /// this call expired.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Store`] / [`CheckoutError::Audit`] if the
    /// store fails.
    pub async fn sweep_expired(&self) -> Result<usize, CheckoutError> {
        let now = self.clock.now();
        let mut expired = 0;
        for checkout in self.records.scan::<Checkout>(CHECKOUT_PREFIX).await? {
            if checkout.value.is_overdue(now) && self.expire(&checkout, now).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "expiry sweep closed checkouts");
        }
        Ok(expired)
    }

    /// The tenant's checkouts, optionally in one state, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Store`] if the store fails.
    pub async fn list_for_tenant(
        &self,
        tenant: TenantId,
        state: Option<CheckoutState>,
        page: Page,
    ) -> Result<Vec<CheckoutSummary>, CheckoutError> {
        let now = self.clock.now();
        let mut checkouts: Vec<Checkout> = self
            .records
            .scan::<Checkout>(CHECKOUT_PREFIX)
            .await?
            .into_iter()
            .map(Versioned::into_inner)
            .filter(|c| c.tenant == tenant && state.is_none_or(|s| c.effective_state(now) == s))
            .collect();
        newest_first(&mut checkouts);
        Ok(page
            .apply(checkouts)
            .iter()
            .map(|c| CheckoutSummary::observed(c, now))
            .collect())
    }

    /// Rebuild the quota tracker from persisted checkouts.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Invariant`] if a checkout references a
    /// policy that no longer loads.
    pub async fn restore_quota(&self) -> Result<usize, CheckoutError> {
        let now = self.clock.now();
        let mut restored = 0;
        for checkout in self.records.scan::<Checkout>(CHECKOUT_PREFIX).await? {
            let checkout = checkout.into_inner();
            let Some(policy) = self.policies.get(checkout.policy_id).await? else {
                error!(
                    checkout_id = %checkout.id,
                    policy_id = %checkout.policy_id,
                    "checkout references a missing policy"
                );
                return Err(CheckoutError::Invariant {
                    reason: format!(
                        "checkout {} references missing policy {}",
                        checkout.id, checkout.policy_id
                    ),
                });
            };
            self.engine.tracker().restore(
                RestoredCheckout {
                    scope: checkout.quota_scope(),
                    reservation: checkout.reservation,
                    window_secs: policy.window.length_secs(),
                    issued_at: checkout.issued_at,
                    expires_at: checkout.expires_at,
                    active: checkout.state == CheckoutState::Active,
                },
                now,
            );
            restored += 1;
        }
        debug!(restored, "quota tracker restored");
        Ok(restored)
    }
}

impl fmt::Debug for CheckoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckoutManager")
            .field("vault", &self.vault)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
