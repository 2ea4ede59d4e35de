//! Administrator routes: `/v1/admin/*`
//!
//! Every handler here requires an admin token; the broker enforces the role
//! and scopes each operation to the caller's tenant.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentkey_core::audit::{AuditAction, AuditFilter, AuditRecord};
use agentkey_core::checkout::{CheckoutState, CheckoutSummary};
use agentkey_core::identity::{ActorRecord, Identity};
use agentkey_core::ids::{ActorId, CheckoutId, PolicyId, SecretId, ServiceId};
use agentkey_core::policy::{NewPolicy, Policy, PolicyUpdate, RateWindow};
use agentkey_core::records::Page;
use agentkey_core::vault::SecretMetadata;

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/v1/admin` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/secrets", post(deposit_secret).get(list_secrets))
        .route("/secrets/{id}", delete(revoke_secret))
        .route("/secrets/{id}/rotate", post(rotate_secret))
        .route("/policies", post(create_policy).get(list_policies))
        .route("/policies/{id}", put(update_policy))
        .route("/checkouts", get(list_checkouts))
        .route("/checkouts/{id}/revoke", post(revoke_checkout))
        .route("/audit", get(query_audit))
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/{id}", delete(revoke_agent))
}

fn parse_service(raw: &str) -> Result<ServiceId, AppError> {
    ServiceId::parse(raw).map_err(AppError::BadRequest)
}

fn page(limit: Option<usize>, offset: Option<usize>) -> Result<Page, AppError> {
    Page::new(limit, offset).map_err(AppError::BadRequest)
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceFilter {
    pub service: Option<String>,
}

impl ServiceFilter {
    fn parse(&self) -> Result<Option<ServiceId>, AppError> {
        self.service.as_deref().map(parse_service).transpose()
    }
}

// ── Secrets ──────────────────────────────────────────────────────────

/// How the `secret` field of a deposit is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Deserialize)]
pub struct DepositRequest {
    pub service: String,
    pub label: String,
    pub secret: String,
    #[serde(default)]
    pub encoding: SecretEncoding,
}

impl std::fmt::Debug for DepositRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepositRequest")
            .field("service", &self.service)
            .field("label", &self.label)
            .field("secret", &"[REDACTED]")
            .field("encoding", &self.encoding)
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct SecretsResponse {
    pub secrets: Vec<SecretMetadata>,
}

async fn deposit_secret(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<DepositRequest>,
) -> Result<(StatusCode, Json<SecretMetadata>), AppError> {
    let service = parse_service(&body.service)?;
    let plaintext = match body.encoding {
        SecretEncoding::Utf8 => body.secret.into_bytes(),
        SecretEncoding::Base64 => BASE64
            .decode(body.secret.as_bytes())
            .map_err(|e| AppError::BadRequest(format!("secret is not valid base64: {e}")))?,
    };

    let metadata = state
        .broker
        .deposit_secret(&identity, service, &plaintext, &body.label)
        .await?;
    Ok((StatusCode::CREATED, Json(metadata)))
}

async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(filter): Query<ServiceFilter>,
) -> Result<Json<SecretsResponse>, AppError> {
    let service = filter.parse()?;
    let secrets = state
        .broker
        .list_secrets(&identity, service.as_ref())
        .await?;
    Ok(Json(SecretsResponse { secrets }))
}

async fn revoke_secret(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<SecretId>,
) -> Result<Json<SecretMetadata>, AppError> {
    Ok(Json(state.broker.revoke_secret(&identity, id).await?))
}

async fn rotate_secret(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<SecretId>,
) -> Result<Json<SecretMetadata>, AppError> {
    Ok(Json(state.broker.rotate_secret(&identity, id).await?))
}

// ── Policies ─────────────────────────────────────────────────────────

/// Request body for `POST /v1/admin/policies`. Omitted limits take the
/// policy defaults; omitting `actor_id` makes the policy tenant-wide.
#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub service: String,
    pub actor_id: Option<ActorId>,
    pub max_checkouts_per_window: Option<u32>,
    pub window: Option<RateWindow>,
    pub max_active: Option<u32>,
    pub max_ttl_seconds: Option<i64>,
    pub clamp_ttl: Option<bool>,
    pub enabled: Option<bool>,
}

impl CreatePolicyRequest {
    fn into_new_policy(self) -> Result<NewPolicy, AppError> {
        let service = parse_service(&self.service)?;
        let mut new = match self.actor_id {
            Some(actor) => NewPolicy::for_actor(service, actor),
            None => NewPolicy::tenant_wide(service),
        };
        if let Some(v) = self.max_checkouts_per_window {
            new.max_checkouts_per_window = v;
        }
        if let Some(v) = self.window {
            new.window = v;
        }
        if let Some(v) = self.max_active {
            new.max_active = v;
        }
        if let Some(v) = self.max_ttl_seconds {
            new.max_ttl_secs = v;
        }
        if let Some(v) = self.clamp_ttl {
            new.clamp_ttl = v;
        }
        if let Some(v) = self.enabled {
            new.enabled = v;
        }
        Ok(new)
    }
}

/// Request body for `PUT /v1/admin/policies/{id}`.
#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
    pub max_checkouts_per_window: Option<u32>,
    pub window: Option<RateWindow>,
    pub max_active: Option<u32>,
    pub max_ttl_seconds: Option<i64>,
    pub clamp_ttl: Option<bool>,
    pub enabled: Option<bool>,
}

impl From<UpdatePolicyRequest> for PolicyUpdate {
    fn from(req: UpdatePolicyRequest) -> Self {
        Self {
            max_checkouts_per_window: req.max_checkouts_per_window,
            window: req.window,
            max_active: req.max_active,
            max_ttl_secs: req.max_ttl_seconds,
            clamp_ttl: req.clamp_ttl,
            enabled: req.enabled,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PoliciesResponse {
    pub policies: Vec<Policy>,
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<Policy>), AppError> {
    let new = body.into_new_policy()?;
    let policy = state.broker.create_policy(&identity, new).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list_policies(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(filter): Query<ServiceFilter>,
) -> Result<Json<PoliciesResponse>, AppError> {
    let service = filter.parse()?;
    let policies = state
        .broker
        .list_policies(&identity, service.as_ref())
        .await?;
    Ok(Json(PoliciesResponse { policies }))
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<PolicyId>,
    Json(body): Json<UpdatePolicyRequest>,
) -> Result<Json<Policy>, AppError> {
    let update = PolicyUpdate::from(body);
    Ok(Json(
        state.broker.update_policy(&identity, id, &update).await?,
    ))
}

// ── Checkouts ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckoutQuery {
    pub state: Option<CheckoutState>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutsResponse {
    pub checkouts: Vec<CheckoutSummary>,
}

async fn list_checkouts(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<CheckoutQuery>,
) -> Result<Json<CheckoutsResponse>, AppError> {
    let page = page(query.limit, query.offset)?;
    let checkouts = state
        .broker
        .list_checkouts(&identity, query.state, page)
        .await?;
    Ok(Json(CheckoutsResponse { checkouts }))
}

async fn revoke_checkout(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<CheckoutId>,
) -> Result<Json<CheckoutSummary>, AppError> {
    Ok(Json(state.broker.revoke_checkout(&identity, id).await?))
}

// ── Audit ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub actor_id: Option<ActorId>,
    pub subject_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub records: Vec<AuditRecord>,
}

async fn query_audit(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditResponse>, AppError> {
    let filter = AuditFilter {
        action: query.action,
        actor: query.actor_id,
        subject_id: query.subject_id,
        since: query.since,
        until: query.until,
        page: page(query.limit, query.offset)?,
    };
    let records = state.broker.query_audit(&identity, &filter).await?;
    Ok(Json(AuditResponse { records }))
}

// ── Agents ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
}

/// An agent as shown to administrators. The token hash stays server-side.
#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: ActorId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<ActorRecord> for AgentView {
    fn from(actor: ActorRecord) -> Self {
        Self {
            id: actor.id,
            name: actor.name,
            created_at: actor.created_at,
            revoked_at: actor.revoked_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedAgentResponse {
    #[serde(flatten)]
    pub agent: AgentView,
    /// The agent's bearer token. Shown once.
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentView>,
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<CreatedAgentResponse>), AppError> {
    let issued = state.broker.issue_agent_token(&identity, &body.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedAgentResponse {
            agent: AgentView::from(issued.actor),
            token: issued.token,
        }),
    ))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<AgentsResponse>, AppError> {
    let agents = state
        .broker
        .list_agents(&identity)
        .await?
        .into_iter()
        .map(AgentView::from)
        .collect();
    Ok(Json(AgentsResponse { agents }))
}

async fn revoke_agent(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<ActorId>,
) -> Result<Json<AgentView>, AppError> {
    let actor = state.broker.revoke_agent(&identity, id).await?;
    Ok(Json(AgentView::from(actor)))
}
