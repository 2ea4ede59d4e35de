//! Admission decisions.
//!
//! [`PolicyEngine::evaluate`] decides whether an actor may check out a
//! credential for a service, and for how long. Its only side effect is the
//! quota reservation it takes on approval; it never touches the vault or
//! the audit ledger. The caller owns the returned [`Reservation`] and must
//! either turn it into a committed checkout or roll it back.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PolicyError;
use crate::ids::{ActorId, ServiceId, TenantId};
use crate::policy::{EffectivePolicy, PolicyStore};
use crate::quota::{QuotaDenial, QuotaLimits, QuotaScope, QuotaTracker, Reservation};

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// No actor-specific or tenant-wide policy exists for the service.
    NoPolicy,
    /// The effective policy is disabled.
    ServiceDisabled,
    /// The issuance limit for the current window is used up.
    RateLimitExceeded,
    /// The actor already holds the maximum number of active checkouts.
    ConcurrencyCapExceeded,
    /// The requested duration exceeds the policy maximum and the policy
    /// does not clamp.
    TtlExceedsMax,
}

impl DenialReason {
    /// The wire name of the reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPolicy => "no_policy",
            Self::ServiceDisabled => "service_disabled",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ConcurrencyCapExceeded => "concurrency_cap_exceeded",
            Self::TtlExceedsMax => "ttl_exceeds_max",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<QuotaDenial> for DenialReason {
    fn from(denial: QuotaDenial) -> Self {
        match denial {
            QuotaDenial::RateLimitExceeded => Self::RateLimitExceeded,
            QuotaDenial::ConcurrencyCapExceeded => Self::ConcurrencyCapExceeded,
        }
    }
}

/// An approved admission. Holds capacity until committed or rolled back.
#[derive(Debug, Clone)]
pub struct Admission {
    pub policy: EffectivePolicy,
    pub granted_ttl_secs: i64,
    pub reservation: Reservation,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The outcome of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone)]
pub enum Decision {
    Approved(Admission),
    Denied(DenialReason),
}

/// Evaluates checkout requests against policies and quota.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policies: PolicyStore,
    tracker: Arc<QuotaTracker>,
    default_ttl_secs: i64,
}

impl PolicyEngine {
    /// Create an engine. `default_ttl_secs` is granted when a request asks
    /// for no particular duration, capped by the policy maximum.
    #[must_use]
    pub fn new(policies: PolicyStore, tracker: Arc<QuotaTracker>, default_ttl_secs: i64) -> Self {
        Self {
            policies,
            tracker,
            default_ttl_secs,
        }
    }

    /// The tracker reservations are taken from.
    #[must_use]
    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    /// Decide on a checkout request at time `now`.
    ///
    /// 1. Resolve the effective policy; none means [`DenialReason::NoPolicy`].
    /// 2. A disabled policy means [`DenialReason::ServiceDisabled`].
    /// 3. Grant `min(requested, max_ttl)`, or the default for a request of
    ///    zero or less. A policy with `clamp_ttl = false` denies over-long
    ///    requests with [`DenialReason::TtlExceedsMax`] instead.
    /// 4. Reserve one unit of rate and concurrency capacity atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the policy cannot be loaded. No
    /// reservation is held in that case.
    pub async fn evaluate(
        &self,
        tenant: TenantId,
        actor: ActorId,
        service: &ServiceId,
        requested_ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Decision, PolicyError> {
        let Some(effective) = self.policies.resolve(tenant, actor, service).await? else {
            return Ok(Decision::Denied(DenialReason::NoPolicy));
        };
        let policy = effective.policy();
        if !policy.enabled {
            return Ok(Decision::Denied(DenialReason::ServiceDisabled));
        }

        let granted_ttl_secs = if requested_ttl_secs <= 0 {
            self.default_ttl_secs.min(policy.max_ttl_secs)
        } else if requested_ttl_secs > policy.max_ttl_secs {
            if !policy.clamp_ttl {
                return Ok(Decision::Denied(DenialReason::TtlExceedsMax));
            }
            policy.max_ttl_secs
        } else {
            requested_ttl_secs
        };
        let Some(expires_at) =
            Duration::try_seconds(granted_ttl_secs).and_then(|ttl| now.checked_add_signed(ttl))
        else {
            return Ok(Decision::Denied(DenialReason::TtlExceedsMax));
        };

        let scope = QuotaScope {
            tenant,
            actor,
            service: service.clone(),
            policy: policy.id,
        };
        match self
            .tracker
            .try_reserve(scope, QuotaLimits::from(policy), now, expires_at)
        {
            Ok(reservation) => {
                debug!(
                    policy_id = %policy.id,
                    actor_id = %actor,
                    granted_ttl_secs,
                    "admission approved"
                );
                Ok(Decision::Approved(Admission {
                    policy: effective,
                    granted_ttl_secs,
                    reservation,
                    issued_at: now,
                    expires_at,
                }))
            }
            Err(denial) => Ok(Decision::Denied(denial.into())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use agentkey_storage::MemoryBackend;

    use super::*;
    use crate::audit::{AuditActor, StoreLedger};
    use crate::clock::ManualClock;
    use crate::policy::{NewPolicy, PolicyUpdate};
    use crate::records::RecordStore;

    struct Fixture {
        engine: PolicyEngine,
        policies: PolicyStore,
        tenant: TenantId,
        actor: ActorId,
        service: ServiceId,
        now: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let records = RecordStore::new(Arc::new(MemoryBackend::new()));
        let ledger = Arc::new(StoreLedger::open(records.clone(), Vec::new()).await.unwrap());
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let now = crate::clock::Clock::now(clock.as_ref());
        let policies = PolicyStore::new(records, ledger, clock);
        Fixture {
            engine: PolicyEngine::new(policies.clone(), Arc::new(QuotaTracker::new()), 900),
            policies,
            tenant: TenantId::new(),
            actor: ActorId::new(),
            service: ServiceId::parse("openai").unwrap(),
            now,
        }
    }

    impl Fixture {
        async fn evaluate(&self, ttl: i64) -> Decision {
            self.engine
                .evaluate(self.tenant, self.actor, &self.service, ttl, self.now)
                .await
                .unwrap()
        }

        async fn create(&self, new: NewPolicy) -> crate::policy::Policy {
            self.policies
                .create(self.tenant, new, AuditActor::System)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn no_policy_is_denied() {
        let f = fixture().await;
        assert!(matches!(
            f.evaluate(60).await,
            Decision::Denied(DenialReason::NoPolicy)
        ));
    }

    #[tokio::test]
    async fn disabled_policy_is_denied() {
        let f = fixture().await;
        let p = f.create(NewPolicy::tenant_wide(f.service.clone())).await;
        f.policies
            .update(
                f.tenant,
                p.id,
                &PolicyUpdate {
                    enabled: Some(false),
                    ..PolicyUpdate::default()
                },
                AuditActor::System,
            )
            .await
            .unwrap();
        assert!(matches!(
            f.evaluate(60).await,
            Decision::Denied(DenialReason::ServiceDisabled)
        ));
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_policy_max() {
        let f = fixture().await;
        f.create(NewPolicy::tenant_wide(f.service.clone())).await;
        let Decision::Approved(a) = f.evaluate(7200).await else {
            panic!("expected approval");
        };
        assert_eq!(a.granted_ttl_secs, 3600);
        assert_eq!((a.expires_at - a.issued_at).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn non_positive_ttl_uses_default() {
        let f = fixture().await;
        let mut new = NewPolicy::tenant_wide(f.service.clone());
        new.max_active = 5;
        f.create(new).await;
        for ttl in [0, -5] {
            let Decision::Approved(a) = f.evaluate(ttl).await else {
                panic!("expected approval");
            };
            assert_eq!(a.granted_ttl_secs, 900);
        }
    }

    #[tokio::test]
    async fn strict_policy_denies_long_ttl() {
        let f = fixture().await;
        let mut new = NewPolicy::tenant_wide(f.service.clone());
        new.clamp_ttl = false;
        f.create(new).await;
        assert!(matches!(
            f.evaluate(7200).await,
            Decision::Denied(DenialReason::TtlExceedsMax)
        ));
        assert!(matches!(f.evaluate(3600).await, Decision::Approved(_)));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_denied_without_reservation() {
        let f = fixture().await;
        let policy = f.create(NewPolicy::tenant_wide(f.service.clone())).await;
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::seconds(60);

        let decision = f
            .engine
            .evaluate(f.tenant, f.actor, &f.service, 3600, near_end)
            .await
            .unwrap();
        assert!(matches!(
            decision,
            Decision::Denied(DenialReason::TtlExceedsMax)
        ));

        let scope = QuotaScope {
            tenant: f.tenant,
            actor: f.actor,
            service: f.service.clone(),
            policy: policy.id,
        };
        let usage = f.engine.tracker().usage(&scope, 86_400, near_end);
        assert_eq!(usage.active, 0);
        assert_eq!(usage.issued_in_window, 0);
    }

    #[tokio::test]
    async fn concurrency_cap_denies_without_partial_reservation() {
        let f = fixture().await;
        f.create(NewPolicy::tenant_wide(f.service.clone())).await;
        let Decision::Approved(a) = f.evaluate(60).await else {
            panic!("expected approval");
        };
        assert!(matches!(
            f.evaluate(60).await,
            Decision::Denied(DenialReason::ConcurrencyCapExceeded)
        ));
        let usage = f
            .engine
            .tracker()
            .usage(&a.reservation.scope, 86_400, f.now);
        assert_eq!(usage.issued_in_window, 1);
        assert_eq!(usage.active, 1);
    }

    #[tokio::test]
    async fn actor_specific_policy_is_reported() {
        let f = fixture().await;
        f.create(NewPolicy::tenant_wide(f.service.clone())).await;
        f.create(NewPolicy::for_actor(f.service.clone(), f.actor)).await;
        let Decision::Approved(a) = f.evaluate(60).await else {
            panic!("expected approval");
        };
        assert!(matches!(a.policy, EffectivePolicy::ActorSpecific(_)));
    }
}
