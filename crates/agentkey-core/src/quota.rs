//! Quota and concurrency tracker.
//!
//! Counts, per (tenant, actor, service, policy) scope, how many checkouts
//! were issued in the current rate window and which reservations are still
//! active. [`QuotaTracker::try_reserve`] checks both limits and claims one
//! unit of each under a single lock, so two requests racing for the last
//! slot cannot both win.
//!
//! # Windows
//!
//! Rate windows are fixed and aligned to the Unix epoch. The issuance count
//! resets to zero at each boundary, which lets an actor burst up to twice
//! the limit across a boundary. See [`RateWindow`](crate::policy::RateWindow).
//!
//! # Expiry
//!
//! Each active reservation remembers the expiry of the checkout it backs.
//! Only reservations whose expiry is still in the future count against the
//! concurrency cap, so capacity comes back the moment a checkout expires
//! even if nobody has yet marked the record `Expired`. [`release`] then
//! removes the entry exactly once when the checkout reaches a terminal
//! state.
//!
//! The tracker is process memory. On startup it is rebuilt from persisted
//! checkouts with [`restore`].
//!
//! [`release`]: QuotaTracker::release
//! [`restore`]: QuotaTracker::restore

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::ids::{ActorId, PolicyId, ReservationId, ServiceId, TenantId};
use crate::policy::Policy;

/// The unit quota is accounted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaScope {
    pub tenant: TenantId,
    pub actor: ActorId,
    pub service: ServiceId,
    pub policy: PolicyId,
}

/// Limits applied to one reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_per_window: u32,
    pub window_secs: u64,
    pub max_active: u32,
}

impl From<&Policy> for QuotaLimits {
    fn from(policy: &Policy) -> Self {
        Self {
            max_per_window: policy.max_checkouts_per_window,
            window_secs: policy.window.length_secs(),
            max_active: policy.max_active,
        }
    }
}

/// One claimed unit of rate and concurrency capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub scope: QuotaScope,
    /// Start of the rate window the issuance was counted in (Unix seconds).
    pub window_start: i64,
    /// When the backing checkout expires.
    pub expires_at: DateTime<Utc>,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenial {
    RateLimitExceeded,
    ConcurrencyCapExceeded,
}

/// Point-in-time counters for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    pub issued_in_window: u32,
    pub active: u32,
}

/// A persisted checkout replayed into the tracker on startup.
#[derive(Debug, Clone)]
pub struct RestoredCheckout {
    pub scope: QuotaScope,
    pub reservation: ReservationId,
    pub window_secs: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Whether the checkout is still in the `Active` state.
    pub active: bool,
}

#[derive(Debug, Default)]
struct ScopeState {
    window_secs: u64,
    window_start: i64,
    issued: u32,
    active: HashMap<ReservationId, DateTime<Utc>>,
}

impl ScopeState {
    /// Move the rate counter to the window containing `now`.
    fn roll_window(&mut self, window_secs: u64, now: DateTime<Utc>) {
        let start = window_start(now, window_secs);
        if self.window_secs != window_secs || self.window_start != start {
            self.window_secs = window_secs;
            self.window_start = start;
            self.issued = 0;
        }
    }

    fn live_active(&self, now: DateTime<Utc>) -> u32 {
        let live = self.active.values().filter(|exp| **exp > now).count();
        u32::try_from(live).unwrap_or(u32::MAX)
    }
}

/// Start of the epoch-aligned window of `window_secs` containing `at`.
#[must_use]
pub fn window_start(at: DateTime<Utc>, window_secs: u64) -> i64 {
    let len = i64::try_from(window_secs.max(1)).unwrap_or(i64::MAX);
    at.timestamp().div_euclid(len).saturating_mul(len)
}

/// In-memory rate and concurrency counters.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    scopes: Mutex<HashMap<QuotaScope, ScopeState>>,
}

impl QuotaTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QuotaScope, ScopeState>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim one issuance and one active slot, or neither.
    ///
    /// The rate window is checked first, then the concurrency cap. The
    /// returned reservation counts as active until `expires_at` or until it
    /// is released, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns the [`QuotaDenial`] for the first limit that is exhausted.
    pub fn try_reserve(
        &self,
        scope: QuotaScope,
        limits: QuotaLimits,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Reservation, QuotaDenial> {
        let mut scopes = self.lock();
        let state = scopes.entry(scope.clone()).or_default();
        state.roll_window(limits.window_secs, now);

        if state.issued >= limits.max_per_window {
            return Err(QuotaDenial::RateLimitExceeded);
        }
        if state.live_active(now) >= limits.max_active {
            return Err(QuotaDenial::ConcurrencyCapExceeded);
        }

        let id = ReservationId::new();
        state.issued = state.issued.saturating_add(1);
        state.active.insert(id, expires_at);
        Ok(Reservation {
            id,
            scope,
            window_start: state.window_start,
            expires_at,
        })
    }

    /// Undo a reservation whose checkout was never committed.
    ///
    /// Frees the active slot and, if the window has not rolled over since,
    /// the issuance count.
    pub fn rollback(&self, reservation: &Reservation) {
        let mut scopes = self.lock();
        if let Some(state) = scopes.get_mut(&reservation.scope) {
            if state.active.remove(&reservation.id).is_some()
                && state.window_start == reservation.window_start
            {
                state.issued = state.issued.saturating_sub(1);
            }
        }
    }

    /// Free the active slot of a checkout that reached a terminal state.
    ///
    /// Returns `true` the first time it is called for a reservation and
    /// `false` afterwards. The issuance count is never refunded.
    pub fn release(&self, scope: &QuotaScope, reservation: ReservationId) -> bool {
        let mut scopes = self.lock();
        scopes
            .get_mut(scope)
            .is_some_and(|state| state.active.remove(&reservation).is_some())
    }

    /// Replay a persisted checkout.
    pub fn restore(&self, checkout: RestoredCheckout, now: DateTime<Utc>) {
        let mut scopes = self.lock();
        let state = scopes.entry(checkout.scope).or_default();
        state.roll_window(checkout.window_secs, now);
        if window_start(checkout.issued_at, checkout.window_secs) == state.window_start {
            state.issued = state.issued.saturating_add(1);
        }
        if checkout.active {
            state.active.insert(checkout.reservation, checkout.expires_at);
        }
    }

    /// Current counters for a scope.
    #[must_use]
    pub fn usage(&self, scope: &QuotaScope, window_secs: u64, now: DateTime<Utc>) -> QuotaUsage {
        let scopes = self.lock();
        let Some(state) = scopes.get(scope) else {
            return QuotaUsage::default();
        };
        let issued_in_window = if state.window_secs == window_secs
            && state.window_start == window_start(now, window_secs)
        {
            state.issued
        } else {
            0
        };
        QuotaUsage {
            issued_in_window,
            active: state.live_active(now),
        }
    }
}
