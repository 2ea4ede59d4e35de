//! Identities and the bearer-token registry.
//!
//! The checkout core only needs [`IdentityResolver::verify`]: given an
//! opaque credential, who is calling? [`TokenRegistry`] is the bundled
//! implementation. It issues tokens for administrators and agents and
//! resolves them back to an [`Identity`].
//!
//! # Security model
//!
//! - Tokens are `ak_admin_` / `ak_agent_` followed by 24 bytes of OS CSPRNG
//!   randomness, URL-safe base64 encoded.
//! - Only `SHA-256(token)` is persisted; the plaintext is returned once at
//!   issuance.
//! - Lookup is by hash, so the stored value is never compared to the
//!   presented one.
//! - Revoking an actor invalidates its token immediately. The actor name
//!   stays reserved so audit history remains unambiguous.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::audit::{AuditAction, AuditActor, AuditLedger, AuditSubject, NewAuditRecord, SubjectKind};
use crate::clock::Clock;
use crate::crypto;
use crate::error::{AuditError, IdentityError};
use crate::ids::{ActorId, TenantId};
use crate::records::{MAX_COMMIT_ATTEMPTS, RecordStore, Transaction, Versioned};

const TENANT_PREFIX: &str = "tenant/";
const ACTOR_PREFIX: &str = "actor/";
const TOKEN_PREFIX: &str = "token/";
const ACTOR_NAME_PREFIX: &str = "actor-name/";
const BOOTSTRAP_KEY: &str = "system/bootstrap";

/// Random bytes in a token.
const TOKEN_ENTROPY_BYTES: usize = 24;

/// Longest accepted tenant or actor name.
const MAX_NAME_LEN: usize = 128;

/// What a principal may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Manages secrets, policies, agents, and reads the audit log.
    Admin,
    /// Checks credentials out and returns them.
    Agent,
}

impl Role {
    /// The token prefix for this role.
    #[must_use]
    pub fn token_prefix(self) -> &'static str {
        match self {
            Self::Admin => "ak_admin_",
            Self::Agent => "ak_agent_",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Admin => "admin",
            Self::Agent => "agent",
        })
    }
}

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant: TenantId,
    pub actor: ActorId,
    pub role: Role,
    pub name: String,
}

impl Identity {
    /// This identity as the acting party of an audit record.
    #[must_use]
    pub fn audit_actor(&self) -> AuditActor {
        AuditActor::Principal {
            id: self.actor,
            role: self.role,
        }
    }
}

/// Resolves an opaque credential to an identity.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// Verify `credential` and return the identity it belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidCredential`] if the credential is
    /// unknown, malformed, or revoked.
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// An organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub id: ActorId,
    pub tenant: TenantId,
    pub name: String,
    pub role: Role,
    /// SHA-256 of the bearer token, hex-encoded.
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ActorRecord {
    /// Whether the actor's token still authenticates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// A freshly issued token. The plaintext exists only in this value.
#[derive(Clone)]
pub struct IssuedToken {
    pub actor: ActorRecord,
    pub token: String,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("actor", &self.actor)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Result of the one-time bootstrap.
#[derive(Debug, Clone)]
pub struct Bootstrapped {
    pub tenant: TenantRecord,
    pub admin: IssuedToken,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenIndex {
    actor: ActorId,
}

/// Hash a plaintext token with SHA-256, returning the hex digest.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn generate_token(role: Role) -> String {
    let entropy = crypto::random_bytes(TOKEN_ENTROPY_BYTES);
    format!("{}{}", role.token_prefix(), URL_SAFE_NO_PAD.encode(entropy))
}

fn validate_name(kind: &str, raw: &str) -> Result<String, IdentityError> {
    let name = raw.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(IdentityError::Invalid {
            reason: format!("{kind} name must be 1 to {MAX_NAME_LEN} bytes"),
        });
    }
    Ok(name.to_owned())
}

fn tenant_key(id: TenantId) -> String {
    format!("{TENANT_PREFIX}{id}")
}

fn actor_key(id: ActorId) -> String {
    format!("{ACTOR_PREFIX}{id}")
}

fn name_key(tenant: TenantId, role: Role, name: &str) -> String {
    format!("{ACTOR_NAME_PREFIX}{tenant}/{role}/{}", hex::encode(name))
}

/// Issues, lists, revokes, and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenRegistry {
    records: RecordStore,
    ledger: Arc<dyn AuditLedger>,
    clock: Arc<dyn Clock>,
}

impl TokenRegistry {
    /// Create a registry over the shared record store.
    #[must_use]
    pub fn new(records: RecordStore, ledger: Arc<dyn AuditLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records,
            ledger,
            clock,
        }
    }

    fn stage_actor(
        txn: &mut Transaction,
        tenant: TenantId,
        name: String,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, IdentityError> {
        let token = generate_token(role);
        let actor = ActorRecord {
            id: ActorId::new(),
            tenant,
            name,
            role,
            token_hash: hash_token(&token),
            created_at: now,
            revoked_at: None,
        };
        txn.insert(&name_key(tenant, role, &actor.name), &actor.id)?;
        txn.insert(&actor_key(actor.id), &actor)?;
        txn.insert(
            &format!("{TOKEN_PREFIX}{}", actor.token_hash),
            &TokenIndex { actor: actor.id },
        )?;
        Ok(IssuedToken { actor, token })
    }

    /// Create the first tenant and its administrator.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::AlreadyBootstrapped`] once any tenant exists.
    pub async fn bootstrap(
        &self,
        tenant_name: &str,
        admin_name: &str,
    ) -> Result<Bootstrapped, IdentityError> {
        let tenant_name = validate_name("tenant", tenant_name)?;
        let admin_name = validate_name("admin", admin_name)?;
        if !self.records.keys(TENANT_PREFIX).await?.is_empty() {
            return Err(IdentityError::AlreadyBootstrapped);
        }

        let now = self.clock.now();
        let tenant = TenantRecord {
            id: TenantId::new(),
            name: tenant_name,
            created_at: now,
        };

        let mut txn = Transaction::new();
        txn.insert(BOOTSTRAP_KEY, &tenant.id)?;
        txn.insert(&tenant_key(tenant.id), &tenant)?;
        let admin = Self::stage_actor(&mut txn, tenant.id, admin_name, Role::Admin, now)?;

        let entry = NewAuditRecord::succeeded(
            tenant.id,
            AuditActor::System,
            AuditAction::TenantBootstrap,
            AuditSubject::new(SubjectKind::Tenant, tenant.id),
            now,
        )
        .with_metadata(serde_json::json!({
            "tenant_name": tenant.name,
            "admin_actor_id": admin.actor.id,
        }));

        match self.ledger.record(txn, entry).await {
            Ok(_) => {}
            Err(AuditError::Conflict { .. }) => return Err(IdentityError::AlreadyBootstrapped),
            Err(e) => return Err(e.into()),
        }

        info!(tenant_id = %tenant.id, admin_id = %admin.actor.id, "tenant bootstrapped");
        Ok(Bootstrapped { tenant, admin })
    }

    /// Issue a token for a new actor in `tenant`.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::Invalid`] if the name is empty or too long.
    /// - [`IdentityError::NameTaken`] if the tenant already has an actor
    ///   with this name and role.
    pub async fn issue(
        &self,
        tenant: TenantId,
        name: &str,
        role: Role,
        issued_by: AuditActor,
    ) -> Result<IssuedToken, IdentityError> {
        let name = validate_name("actor", name)?;
        let now = self.clock.now();

        let mut txn = Transaction::new();
        let issued = Self::stage_actor(&mut txn, tenant, name, role, now)?;

        let entry = NewAuditRecord::succeeded(
            tenant,
            issued_by,
            AuditAction::TokenIssue,
            AuditSubject::new(SubjectKind::Actor, issued.actor.id),
            now,
        )
        .with_metadata(serde_json::json!({
            "name": issued.actor.name,
            "role": issued.actor.role,
        }));

        match self.ledger.record(txn, entry).await {
            Ok(_) => {}
            Err(AuditError::Conflict { .. }) => {
                return Err(IdentityError::NameTaken {
                    name: issued.actor.name,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(actor_id = %issued.actor.id, role = %role, "token issued");
        Ok(issued)
    }

    /// Revoke an actor's token. Revoking twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] if the actor does not belong to
    /// `tenant`.
    pub async fn revoke(
        &self,
        tenant: TenantId,
        actor_id: ActorId,
        revoked_by: AuditActor,
    ) -> Result<ActorRecord, IdentityError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load_actor(tenant, actor_id).await?;
            if !current.value.is_active() {
                return Ok(current.value);
            }

            let now = self.clock.now();
            let mut updated = current.value.clone();
            updated.revoked_at = Some(now);

            let mut txn = Transaction::new();
            txn.replace(&current, &updated)?;
            let entry = NewAuditRecord::succeeded(
                tenant,
                revoked_by,
                AuditAction::TokenRevoke,
                AuditSubject::new(SubjectKind::Actor, actor_id),
                now,
            );

            match self.ledger.record(txn, entry).await {
                Ok(_) => {
                    info!(actor_id = %actor_id, "token revoked");
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Look up one of the tenant's actors, revoked or not.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] if the tenant has no such actor.
    pub async fn actor(
        &self,
        tenant: TenantId,
        actor_id: ActorId,
    ) -> Result<ActorRecord, IdentityError> {
        Ok(self.load_actor(tenant, actor_id).await?.into_inner())
    }

    async fn load_actor(
        &self,
        tenant: TenantId,
        actor_id: ActorId,
    ) -> Result<Versioned<ActorRecord>, IdentityError> {
        match self
            .records
            .get_versioned::<ActorRecord>(&actor_key(actor_id))
            .await?
        {
            Some(actor) if actor.value.tenant == tenant => Ok(actor),
            _ => Err(IdentityError::NotFound {
                actor_id: actor_id.to_string(),
            }),
        }
    }

    /// All actors of a tenant, optionally restricted to one role, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Store`] if the store fails.
    pub async fn list(
        &self,
        tenant: TenantId,
        role: Option<Role>,
    ) -> Result<Vec<ActorRecord>, IdentityError> {
        let mut actors: Vec<ActorRecord> = self
            .records
            .scan::<ActorRecord>(ACTOR_PREFIX)
            .await?
            .into_iter()
            .map(Versioned::into_inner)
            .filter(|a| a.tenant == tenant && role.is_none_or(|r| r == a.role))
            .collect();
        actors.sort_by_key(|a| a.created_at);
        Ok(actors)
    }

    /// Look up a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Store`] if the store fails.
    pub async fn tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, IdentityError> {
        Ok(self.records.get(&tenant_key(id)).await?)
    }
}

#[async_trait::async_trait]
impl IdentityResolver for TokenRegistry {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        let role = if credential.starts_with(Role::Admin.token_prefix()) {
            Role::Admin
        } else if credential.starts_with(Role::Agent.token_prefix()) {
            Role::Agent
        } else {
            return Err(IdentityError::InvalidCredential);
        };

        let index: TokenIndex = self
            .records
            .get(&format!("{TOKEN_PREFIX}{}", hash_token(credential)))
            .await?
            .ok_or(IdentityError::InvalidCredential)?;
        let actor: ActorRecord = self
            .records
            .get(&actor_key(index.actor))
            .await?
            .ok_or(IdentityError::InvalidCredential)?;

        if !actor.is_active() || actor.role != role {
            return Err(IdentityError::InvalidCredential);
        }

        Ok(Identity {
            tenant: actor.tenant,
            actor: actor.id,
            role: actor.role,
            name: actor.name,
        })
    }
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry").finish_non_exhaustive()
    }
}
