//! The broker facade.
//!
//! [`Broker`] wires the vault, policy engine, quota tracker, checkout
//! lifecycle, audit ledger, and token registry over one storage backend and
//! exposes the operations callers use. Every method that acts on behalf of a
//! principal takes the verified [`Identity`] and checks its role: agents
//! check out, return, and list their own checkouts; administrators manage
//! everything else within their tenant.

use std::sync::Arc;
use std::time::Duration;

use agentkey_storage::StorageBackend;
use tracing::{error, info, warn};

use crate::audit::{
    AuditAction, AuditFilter, AuditLedger, AuditRecord, AuditSink, AuditSubject, Fingerprinter,
    NewAuditRecord, StoreLedger, SubjectKind,
};
use crate::checkout::{CheckoutGrant, CheckoutManager, CheckoutState, CheckoutSummary};
use crate::clock::{Clock, SystemClock};
use crate::crypto::EncryptionKey;
use crate::error::BrokerError;
use crate::identity::{ActorRecord, Bootstrapped, Identity, IssuedToken, Role, TokenRegistry};
use crate::ids::{ActorId, CheckoutId, PolicyId, SecretId, ServiceId};
use crate::kms::KeyManagement;
use crate::policy::{NewPolicy, Policy, PolicyScope, PolicyStore, PolicyUpdate};
use crate::policy_engine::PolicyEngine;
use crate::quota::QuotaTracker;
use crate::records::{Page, RecordStore, Transaction};
use crate::vault::{CredentialVault, SecretMetadata};

/// Checkout duration granted when a request names none.
pub const DEFAULT_CHECKOUT_TTL_SECS: i64 = 3600;

/// Upper bound on a single key-management call.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Options for [`Broker::open`].
pub struct BrokerOptions {
    /// Time source for every timestamp and expiry decision.
    pub clock: Arc<dyn Clock>,
    /// Mirrors for committed audit records.
    pub sinks: Vec<Arc<dyn AuditSink>>,
    /// Key for disclosure fingerprints in checkout audit records.
    pub audit_hmac_key: EncryptionKey,
    pub default_ttl_secs: i64,
    pub kms_timeout: Duration,
}

impl BrokerOptions {
    /// Defaults with the system clock and no audit mirrors.
    #[must_use]
    pub fn new(audit_hmac_key: EncryptionKey) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            sinks: Vec::new(),
            audit_hmac_key,
            default_ttl_secs: DEFAULT_CHECKOUT_TTL_SECS,
            kms_timeout: DEFAULT_KMS_TIMEOUT,
        }
    }
}

/// The credential-checkout broker.
#[derive(Clone)]
pub struct Broker {
    identities: TokenRegistry,
    policies: PolicyStore,
    vault: CredentialVault,
    checkouts: CheckoutManager,
    ledger: Arc<StoreLedger>,
    clock: Arc<dyn Clock>,
}

impl Broker {
    /// Open the broker over `backend`, rebuilding quota state from the
    /// persisted checkouts.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Invalid`] if the default TTL is not positive.
    /// - [`BrokerError::Audit`] if the ledger cannot be opened.
    /// - [`BrokerError::Checkout`] if quota restoration finds a checkout
    ///   whose policy is missing.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        kms: Arc<dyn KeyManagement>,
        options: BrokerOptions,
    ) -> Result<Self, BrokerError> {
        if options.default_ttl_secs <= 0 {
            return Err(BrokerError::Invalid {
                reason: "default checkout TTL must be positive".to_owned(),
            });
        }

        let records = RecordStore::new(backend);
        let ledger = Arc::new(StoreLedger::open(records.clone(), options.sinks).await?);
        let clock = options.clock;

        let identities = TokenRegistry::new(records.clone(), ledger.clone(), clock.clone());
        let policies = PolicyStore::new(records.clone(), ledger.clone(), clock.clone());
        let vault = CredentialVault::new(
            records.clone(),
            ledger.clone(),
            kms,
            clock.clone(),
            options.kms_timeout,
        );
        let engine = PolicyEngine::new(
            policies.clone(),
            Arc::new(QuotaTracker::new()),
            options.default_ttl_secs,
        );
        let checkouts = CheckoutManager::new(
            records,
            ledger.clone(),
            vault.clone(),
            engine,
            policies.clone(),
            clock.clone(),
            Arc::new(Fingerprinter::new(options.audit_hmac_key)),
        );

        let restored = checkouts.restore_quota().await?;
        info!(restored_checkouts = restored, "broker opened");

        Ok(Self {
            identities,
            policies,
            vault,
            checkouts,
            ledger,
            clock,
        })
    }

    /// Refuse callers without `role`. Every refusal is audited as
    /// [`AuditAction::AccessDenied`] against the caller.
    async fn require(
        &self,
        identity: &Identity,
        role: Role,
        operation: &'static str,
    ) -> Result<(), BrokerError> {
        if identity.role == role {
            return Ok(());
        }
        let entry = NewAuditRecord::succeeded(
            identity.tenant,
            identity.audit_actor(),
            AuditAction::AccessDenied,
            AuditSubject::new(SubjectKind::Actor, identity.actor),
            self.clock.now(),
        )
        .denied("forbidden")
        .with_metadata(serde_json::json!({
            "operation": operation,
            "required_role": role,
        }));
        if let Err(e) = self.ledger.record(Transaction::new(), entry).await {
            error!(
                actor_id = %identity.actor,
                operation,
                error = %e,
                "failed to audit refused operation"
            );
        }
        warn!(actor_id = %identity.actor, operation, required = ?role, "operation refused");
        Err(BrokerError::Forbidden { required: role })
    }

    /// The token registry, for resolving bearer credentials.
    #[must_use]
    pub fn identities(&self) -> &TokenRegistry {
        &self.identities
    }

    /// Create the first tenant and its administrator token.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Identity`] if any tenant already exists.
    pub async fn bootstrap(
        &self,
        tenant_name: &str,
        admin_name: &str,
    ) -> Result<Bootstrapped, BrokerError> {
        Ok(self.identities.bootstrap(tenant_name, admin_name).await?)
    }

    // ── Agent operations ─────────────────────────────────────────────

    /// Check out the caller's credential for `service`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-agents, otherwise see
    /// [`CheckoutManager::checkout`].
    pub async fn checkout(
        &self,
        identity: &Identity,
        service: &ServiceId,
        requested_ttl_secs: i64,
    ) -> Result<CheckoutGrant, BrokerError> {
        self.require(identity, Role::Agent, "checkout").await?;
        Ok(self
            .checkouts
            .checkout(identity, service, requested_ttl_secs)
            .await?)
    }

    /// Return one of the caller's checkouts early.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-agents, otherwise see
    /// [`CheckoutManager::return_checkout`].
    pub async fn return_checkout(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
    ) -> Result<CheckoutSummary, BrokerError> {
        self.require(identity, Role::Agent, "return_checkout").await?;
        Ok(self.checkouts.return_checkout(identity, checkout_id).await?)
    }

    /// The caller's active checkouts. Never includes plaintext.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-agents, or a store failure.
    pub async fn list_active_checkouts(
        &self,
        identity: &Identity,
    ) -> Result<Vec<CheckoutSummary>, BrokerError> {
        self.require(identity, Role::Agent, "list_active_checkouts").await?;
        Ok(self.checkouts.list_active(identity).await?)
    }

    // ── Administrator operations ─────────────────────────────────────

    /// Revoke an active checkout.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, otherwise see
    /// [`CheckoutManager::revoke_checkout`].
    pub async fn revoke_checkout(
        &self,
        identity: &Identity,
        checkout_id: CheckoutId,
    ) -> Result<CheckoutSummary, BrokerError> {
        self.require(identity, Role::Admin, "revoke_checkout").await?;
        Ok(self.checkouts.revoke_checkout(identity, checkout_id).await?)
    }

    /// The tenant's checkouts, newest first.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or a store failure.
    pub async fn list_checkouts(
        &self,
        identity: &Identity,
        state: Option<CheckoutState>,
        page: Page,
    ) -> Result<Vec<CheckoutSummary>, BrokerError> {
        self.require(identity, Role::Admin, "list_checkouts").await?;
        Ok(self
            .checkouts
            .list_for_tenant(identity.tenant, state, page)
            .await?)
    }

    /// Encrypt and store an upstream credential.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, otherwise see
    /// [`CredentialVault::deposit`].
    pub async fn deposit_secret(
        &self,
        identity: &Identity,
        service: ServiceId,
        plaintext: &[u8],
        label: &str,
    ) -> Result<SecretMetadata, BrokerError> {
        self.require(identity, Role::Admin, "deposit_secret").await?;
        Ok(self
            .vault
            .deposit(
                identity.tenant,
                service,
                plaintext,
                label,
                identity.audit_actor(),
            )
            .await?)
    }

    /// Revoke a stored secret. Already revoked secrets are left as they are.
    ///
    /// Future checkouts can no longer use the secret. Credentials already
    /// disclosed stay valid upstream.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or
    /// [`VaultError::NotFound`](crate::error::VaultError::NotFound).
    pub async fn revoke_secret(
        &self,
        identity: &Identity,
        secret_id: SecretId,
    ) -> Result<SecretMetadata, BrokerError> {
        self.require(identity, Role::Admin, "revoke_secret").await?;
        Ok(self
            .vault
            .revoke(identity.tenant, secret_id, identity.audit_actor())
            .await?)
    }

    /// Re-encrypt a stored secret under a fresh data key.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, otherwise see
    /// [`CredentialVault::rotate`].
    pub async fn rotate_secret(
        &self,
        identity: &Identity,
        secret_id: SecretId,
    ) -> Result<SecretMetadata, BrokerError> {
        self.require(identity, Role::Admin, "rotate_secret").await?;
        Ok(self
            .vault
            .rotate(identity.tenant, secret_id, identity.audit_actor())
            .await?)
    }

    /// Metadata of the tenant's secrets.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or a store failure.
    pub async fn list_secrets(
        &self,
        identity: &Identity,
        service: Option<&ServiceId>,
    ) -> Result<Vec<SecretMetadata>, BrokerError> {
        self.require(identity, Role::Admin, "list_secrets").await?;
        Ok(self.vault.list(identity.tenant, service).await?)
    }

    /// Create a policy. An actor-scoped policy must name one of the tenant's
    /// agents.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Forbidden`] for non-admins.
    /// - [`BrokerError::Identity`] if the named actor does not exist.
    /// - [`BrokerError::Invalid`] if the named actor is not an agent.
    /// - [`BrokerError::Policy`] on invalid limits or a duplicate.
    pub async fn create_policy(
        &self,
        identity: &Identity,
        new: NewPolicy,
    ) -> Result<Policy, BrokerError> {
        self.require(identity, Role::Admin, "create_policy").await?;
        if let PolicyScope::Actor { actor } = new.scope {
            let record = self.identities.actor(identity.tenant, actor).await?;
            if record.role != Role::Agent {
                return Err(BrokerError::Invalid {
                    reason: format!("policy actor {actor} is not an agent"),
                });
            }
        }
        Ok(self
            .policies
            .create(identity.tenant, new, identity.audit_actor())
            .await?)
    }

    /// Patch a policy's limits or enabled flag.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, otherwise see
    /// [`PolicyStore::update`].
    pub async fn update_policy(
        &self,
        identity: &Identity,
        policy_id: PolicyId,
        update: &PolicyUpdate,
    ) -> Result<Policy, BrokerError> {
        self.require(identity, Role::Admin, "update_policy").await?;
        Ok(self
            .policies
            .update(identity.tenant, policy_id, update, identity.audit_actor())
            .await?)
    }

    /// The tenant's policies.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or a store failure.
    pub async fn list_policies(
        &self,
        identity: &Identity,
        service: Option<&ServiceId>,
    ) -> Result<Vec<Policy>, BrokerError> {
        self.require(identity, Role::Admin, "list_policies").await?;
        Ok(self.policies.list(identity.tenant, service).await?)
    }

    /// The tenant's audit records, newest first.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or a store failure.
    pub async fn query_audit(
        &self,
        identity: &Identity,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>, BrokerError> {
        self.require(identity, Role::Admin, "query_audit").await?;
        Ok(self.ledger.query(identity.tenant, filter).await?)
    }

    /// Issue a token for a new agent. The plaintext token is returned once.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or
    /// [`IdentityError::NameTaken`](crate::error::IdentityError::NameTaken).
    pub async fn issue_agent_token(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<IssuedToken, BrokerError> {
        self.require(identity, Role::Admin, "issue_agent_token").await?;
        Ok(self
            .identities
            .issue(identity.tenant, name, Role::Agent, identity.audit_actor())
            .await?)
    }

    /// The tenant's agents, including revoked ones.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or a store failure.
    pub async fn list_agents(&self, identity: &Identity) -> Result<Vec<ActorRecord>, BrokerError> {
        self.require(identity, Role::Admin, "list_agents").await?;
        Ok(self
            .identities
            .list(identity.tenant, Some(Role::Agent))
            .await?)
    }

    /// Revoke an agent's token. Its active checkouts run to expiry.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for non-admins, or
    /// [`IdentityError::NotFound`](crate::error::IdentityError::NotFound).
    pub async fn revoke_agent(
        &self,
        identity: &Identity,
        actor_id: ActorId,
    ) -> Result<ActorRecord, BrokerError> {
        self.require(identity, Role::Admin, "revoke_agent").await?;
        let record = self.identities.actor(identity.tenant, actor_id).await?;
        if record.role != Role::Agent {
            return Err(BrokerError::Invalid {
                reason: format!("actor {actor_id} is not an agent"),
            });
        }
        Ok(self
            .identities
            .revoke(identity.tenant, actor_id, identity.audit_actor())
            .await?)
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Expire overdue checkouts across all tenants.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Checkout`] if the store fails.
    pub async fn sweep_expired(&self) -> Result<usize, BrokerError> {
        Ok(self.checkouts.sweep_expired().await?)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("checkouts", &self.checkouts)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use agentkey_storage::MemoryBackend;

    use super::*;
    use crate::audit::AuditOutcome;
    use crate::identity::IdentityResolver;
    use crate::kms::LocalKeyManager;

    async fn broker() -> (Broker, Identity) {
        let kms = Arc::new(LocalKeyManager::from_master_key(EncryptionKey::generate()).unwrap());
        let broker = Broker::open(
            Arc::new(MemoryBackend::new()),
            kms,
            BrokerOptions::new(EncryptionKey::generate()),
        )
        .await
        .unwrap();
        let boot = broker.bootstrap("Acme", "root").await.unwrap();
        let admin = broker.identities().verify(&boot.admin.token).await.unwrap();
        (broker, admin)
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let (broker, admin) = broker().await;
        let service = ServiceId::parse("openai").unwrap();

        assert!(matches!(
            broker.checkout(&admin, &service, 60).await,
            Err(BrokerError::Forbidden {
                required: Role::Agent
            })
        ));

        let token = broker.issue_agent_token(&admin, "crawler").await.unwrap();
        let agent = broker.identities().verify(&token.token).await.unwrap();
        assert!(matches!(
            broker
                .deposit_secret(&agent, service.clone(), b"sk", "prod")
                .await,
            Err(BrokerError::Forbidden {
                required: Role::Admin
            })
        ));
        assert!(matches!(
            broker.query_audit(&agent, &AuditFilter::default()).await,
            Err(BrokerError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn role_refusals_are_audited() {
        let (broker, admin) = broker().await;
        let service = ServiceId::parse("openai").unwrap();

        assert!(broker.checkout(&admin, &service, 60).await.is_err());

        let filter = AuditFilter {
            action: Some(AuditAction::AccessDenied),
            ..AuditFilter::default()
        };
        let refused = broker.query_audit(&admin, &filter).await.unwrap();
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].subject.kind, SubjectKind::Actor);
        assert_eq!(refused[0].subject.id, admin.actor.to_string());
        assert_eq!(
            refused[0].outcome,
            AuditOutcome::Denied {
                reason: "forbidden".to_owned()
            }
        );
        assert_eq!(refused[0].metadata["operation"], "checkout");
        assert_eq!(refused[0].metadata["required_role"], "agent");

        let token = broker.issue_agent_token(&admin, "crawler").await.unwrap();
        let agent = broker.identities().verify(&token.token).await.unwrap();
        assert!(broker.list_agents(&agent).await.is_err());
        let refused = broker.query_audit(&admin, &filter).await.unwrap();
        assert_eq!(refused.len(), 2);
        assert_eq!(refused[0].metadata["operation"], "list_agents");
    }

    #[tokio::test]
    async fn actor_policy_must_name_an_agent_of_the_tenant() {
        let (broker, admin) = broker().await;
        let service = ServiceId::parse("openai").unwrap();

        let err = broker
            .create_policy(&admin, NewPolicy::for_actor(service.clone(), ActorId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Identity(_)));

        let err = broker
            .create_policy(&admin, NewPolicy::for_actor(service.clone(), admin.actor))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Invalid { .. }));

        let token = broker.issue_agent_token(&admin, "crawler").await.unwrap();
        broker
            .create_policy(&admin, NewPolicy::for_actor(service, token.actor.id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_positive_default_ttl_is_rejected() {
        let kms = Arc::new(LocalKeyManager::from_master_key(EncryptionKey::generate()).unwrap());
        let mut options = BrokerOptions::new(EncryptionKey::generate());
        options.default_ttl_secs = 0;
        assert!(matches!(
            Broker::open(Arc::new(MemoryBackend::new()), kms, options).await,
            Err(BrokerError::Invalid { .. })
        ));
    }
}
