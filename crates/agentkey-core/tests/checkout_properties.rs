//! End-to-end checkout behaviour through the broker facade.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use agentkey_core::audit::{AuditAction, AuditFilter, AuditOutcome, AuditRecord};
use agentkey_core::broker::{Broker, BrokerOptions};
use agentkey_core::checkout::CheckoutState;
use agentkey_core::clock::ManualClock;
use agentkey_core::crypto::EncryptionKey;
use agentkey_core::error::{BrokerError, CheckoutError, VaultError};
use agentkey_core::identity::{Identity, IdentityResolver};
use agentkey_core::ids::{SecretId, ServiceId};
use agentkey_core::kms::LocalKeyManager;
use agentkey_core::policy::{NewPolicy, RateWindow};
use agentkey_core::policy_engine::DenialReason;
use agentkey_core::records::Page;
use agentkey_storage::MemoryBackend;
use chrono::Duration;

struct Harness {
    broker: Broker,
    clock: Arc<ManualClock>,
    admin: Identity,
    agent: Identity,
    service: ServiceId,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let kms = Arc::new(LocalKeyManager::from_master_key(EncryptionKey::generate()).unwrap());
    let broker = Broker::open(
        Arc::new(MemoryBackend::new()),
        kms,
        BrokerOptions {
            clock: clock.clone(),
            ..BrokerOptions::new(EncryptionKey::generate())
        },
    )
    .await
    .unwrap();

    let boot = broker.bootstrap("Acme", "root").await.unwrap();
    let admin = broker.identities().verify(&boot.admin.token).await.unwrap();
    let token = broker.issue_agent_token(&admin, "crawler").await.unwrap();
    let agent = broker.identities().verify(&token.token).await.unwrap();

    Harness {
        broker,
        clock,
        admin,
        agent,
        service: ServiceId::parse("openai").unwrap(),
    }
}

impl Harness {
    async fn deposit(&self, value: &[u8], label: &str) -> SecretId {
        self.broker
            .deposit_secret(&self.admin, self.service.clone(), value, label)
            .await
            .unwrap()
            .id
    }

    async fn policy(&self, configure: impl FnOnce(&mut NewPolicy)) {
        let mut new = NewPolicy::tenant_wide(self.service.clone());
        configure(&mut new);
        self.broker.create_policy(&self.admin, new).await.unwrap();
    }

    async fn audit(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.broker
            .query_audit(
                &self.admin,
                &AuditFilter {
                    action: Some(action),
                    ..AuditFilter::default()
                },
            )
            .await
            .unwrap()
    }
}

fn denial(err: &BrokerError) -> Option<DenialReason> {
    match err {
        BrokerError::Checkout(CheckoutError::Denied(reason)) => Some(*reason),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_admits_exactly_n() {
    const N: u32 = 3;
    let h = harness().await;
    h.deposit(b"sk-cap", "prod").await;
    h.policy(|p| p.max_active = N).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let broker = h.broker.clone();
        let agent = h.agent.clone();
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            broker.checkout(&agent, &service, 600).await
        }));
    }

    let mut granted = 0;
    let mut capped = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => granted += 1,
            Err(e) if denial(&e) == Some(DenialReason::ConcurrencyCapExceeded) => capped += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(granted, N);
    assert_eq!(capped, 8 - N);
    assert_eq!(
        h.broker.list_active_checkouts(&h.agent).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn checkout_reveals_deposited_bytes() {
    let h = harness().await;
    let value = b"sk-live-\x00\xff-binary";
    h.deposit(value, "prod").await;
    h.policy(|_| {}).await;

    let grant = h.broker.checkout(&h.agent, &h.service, 60).await.unwrap();
    assert_eq!(grant.plaintext(), value);
}

#[tokio::test]
async fn revoked_secret_blocks_later_checkouts_only() {
    let h = harness().await;
    let secret = h.deposit(b"sk-revoke", "prod").await;
    h.policy(|p| p.max_active = 5).await;

    let first = h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    h.broker.revoke_secret(&h.admin, secret).await.unwrap();

    let err = h
        .broker
        .checkout(&h.agent, &h.service, 600)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Checkout(CheckoutError::Vault(VaultError::Revoked { .. }))
    ));

    assert_eq!(first.plaintext(), b"sk-revoke");
    let active = h.broker.list_active_checkouts(&h.agent).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first.checkout.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_double_return_releases_once() {
    let h = harness().await;
    h.deposit(b"sk", "prod").await;
    h.policy(|_| {}).await;
    let grant = h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    let id = grant.checkout.id;

    let (a, b) = tokio::join!(
        h.broker.return_checkout(&h.agent, id),
        h.broker.return_checkout(&h.agent, id)
    );
    let outcomes = [a, b];
    let returned = outcomes.iter().filter(|r| r.is_ok()).count();
    let terminal = outcomes
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(BrokerError::Checkout(CheckoutError::AlreadyTerminal {
                    state: CheckoutState::Returned,
                    ..
                }))
            )
        })
        .count();
    assert_eq!(returned, 1);
    assert_eq!(terminal, 1);

    // The single slot is free again, and only once: a second checkout fills it.
    h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    let err = h
        .broker
        .checkout(&h.agent, &h.service, 600)
        .await
        .unwrap_err();
    assert_eq!(denial(&err), Some(DenialReason::ConcurrencyCapExceeded));
}

#[tokio::test]
async fn return_and_revoke_race_has_one_winner() {
    let h = harness().await;
    h.deposit(b"sk", "prod").await;
    h.policy(|_| {}).await;
    let grant = h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    let id = grant.checkout.id;

    let (returned, revoked) = tokio::join!(
        h.broker.return_checkout(&h.agent, id),
        h.broker.revoke_checkout(&h.admin, id)
    );
    assert_ne!(returned.is_ok(), revoked.is_ok());

    let checkouts = h
        .broker
        .list_checkouts(&h.admin, None, Page::default())
        .await
        .unwrap();
    assert_eq!(checkouts.len(), 1);
    assert!(matches!(
        checkouts[0].state,
        CheckoutState::Returned | CheckoutState::Revoked
    ));
}

#[tokio::test]
async fn hourly_rate_limit_resets_with_the_window() {
    let h = harness().await;
    h.deposit(b"sk", "prod").await;
    h.policy(|p| {
        p.max_checkouts_per_window = 3;
        p.window = RateWindow::Hourly;
        p.max_active = 10;
    })
    .await;

    for _ in 0..3 {
        h.broker.checkout(&h.agent, &h.service, 60).await.unwrap();
    }
    let err = h
        .broker
        .checkout(&h.agent, &h.service, 60)
        .await
        .unwrap_err();
    assert_eq!(denial(&err), Some(DenialReason::RateLimitExceeded));
    assert!(!err.is_retryable());

    h.clock.advance(Duration::hours(1));
    h.broker.checkout(&h.agent, &h.service, 60).await.unwrap();
}

#[tokio::test]
async fn ttl_is_clamped_to_policy_maximum() {
    let h = harness().await;
    h.deposit(b"sk", "prod").await;
    h.policy(|p| p.max_ttl_secs = 3600).await;

    let grant = h.broker.checkout(&h.agent, &h.service, 7200).await.unwrap();
    assert_eq!(
        (grant.checkout.expires_at - grant.checkout.issued_at).num_seconds(),
        3600
    );
}

#[tokio::test]
async fn every_lifecycle_step_is_audited_once() {
    let h = harness().await;
    h.deposit(b"sk", "prod").await;
    h.policy(|p| p.max_active = 2).await;

    let first = h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    let second = h.broker.checkout(&h.agent, &h.service, 600).await.unwrap();
    let denied = h
        .broker
        .checkout(&h.agent, &h.service, 600)
        .await
        .unwrap_err();
    assert_eq!(denial(&denied), Some(DenialReason::ConcurrencyCapExceeded));

    h.broker
        .return_checkout(&h.agent, first.checkout.id)
        .await
        .unwrap();
    h.broker
        .revoke_checkout(&h.admin, second.checkout.id)
        .await
        .unwrap();

    let issued = h.audit(AuditAction::CheckoutIssue).await;
    assert_eq!(issued.len(), 3);
    assert_eq!(
        issued
            .iter()
            .filter(|r| r.outcome == AuditOutcome::Succeeded)
            .count(),
        2
    );
    assert_eq!(
        issued
            .iter()
            .filter(|r| matches!(r.outcome, AuditOutcome::Denied { .. }))
            .count(),
        1
    );

    let returns = h.audit(AuditAction::CheckoutReturn).await;
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].subject.id, first.checkout.id.to_string());

    let revokes = h.audit(AuditAction::CheckoutRevoke).await;
    assert_eq!(revokes.len(), 1);
    assert_eq!(revokes[0].subject.id, second.checkout.id.to_string());
    assert_eq!(revokes[0].actor.actor_id(), Some(h.admin.actor));

    // Newest first, strictly ordered.
    let all = h
        .broker
        .query_audit(&h.admin, &AuditFilter::default())
        .await
        .unwrap();
    assert!(all.windows(2).all(|w| w[0].sequence > w[1].sequence));
}

#[tokio::test]
async fn restart_restores_concurrency_state() {
    let backend = Arc::new(MemoryBackend::new());
    let master = EncryptionKey::generate();
    let hmac = EncryptionKey::generate();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));

    let open = |backend: Arc<MemoryBackend>| {
        let kms = Arc::new(LocalKeyManager::from_master_key(master.clone()).unwrap());
        let options = BrokerOptions {
            clock: clock.clone(),
            ..BrokerOptions::new(hmac.clone())
        };
        async move { Broker::open(backend, kms, options).await.unwrap() }
    };

    let broker = open(backend.clone()).await;
    let boot = broker.bootstrap("Acme", "root").await.unwrap();
    let admin = broker.identities().verify(&boot.admin.token).await.unwrap();
    let token = broker.issue_agent_token(&admin, "crawler").await.unwrap();
    let service = ServiceId::parse("openai").unwrap();
    broker
        .deposit_secret(&admin, service.clone(), b"sk", "prod")
        .await
        .unwrap();
    broker
        .create_policy(&admin, NewPolicy::tenant_wide(service.clone()))
        .await
        .unwrap();
    let agent = broker.identities().verify(&token.token).await.unwrap();
    broker.checkout(&agent, &service, 600).await.unwrap();
    drop(broker);

    let reopened = open(backend).await;
    let err = reopened.checkout(&agent, &service, 600).await.unwrap_err();
    assert_eq!(denial(&err), Some(DenialReason::ConcurrencyCapExceeded));
}
