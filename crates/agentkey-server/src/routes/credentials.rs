//! Agent routes: `/v1/credentials/*`
//!
//! - `POST /v1/credentials/checkout`: check out the credential for a service
//! - `POST /v1/credentials/return`: return a checkout early
//! - `GET  /v1/credentials/active`: the caller's active checkouts

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentkey_core::checkout::CheckoutSummary;
use agentkey_core::identity::Identity;
use agentkey_core::ids::{CheckoutId, ServiceId};

use crate::error::AppError;
use crate::state::AppState;

/// Attached to every checkout response.
pub const USAGE_NOTE: &str = "Agent Key limits how often and for how long this credential is \
     checked out. It does not restrict what the credential can do upstream or how much it \
     can spend; use the provider's own scoping for that.";

/// Build the `/v1/credentials` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/return", post(return_checkout))
        .route("/active", get(active))
}

// ── Request / response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub service: String,
    /// Requested lifetime in seconds. Absent or non-positive means the
    /// default.
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// How `credential` is encoded in a [`CheckoutResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_id: CheckoutId,
    pub service: ServiceId,
    pub credential: String,
    pub encoding: CredentialEncoding,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub note: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ReturnRequest {
    pub checkout_id: CheckoutId,
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub checkouts: Vec<CheckoutSummary>,
}

fn encode_credential(bytes: &[u8]) -> (String, CredentialEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_owned(), CredentialEncoding::Utf8),
        Err(_) => (BASE64.encode(bytes), CredentialEncoding::Base64),
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn checkout(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    let service = ServiceId::parse(&body.service).map_err(AppError::BadRequest)?;
    let grant = state
        .broker
        .checkout(&identity, &service, body.ttl_seconds)
        .await?;

    let (credential, encoding) = encode_credential(grant.plaintext());
    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            checkout_id: grant.checkout.id,
            service: grant.checkout.service.clone(),
            credential,
            encoding,
            issued_at: grant.checkout.issued_at,
            expires_at: grant.checkout.expires_at,
            ttl_seconds: grant.granted_ttl_secs,
            note: USAGE_NOTE,
        }),
    ))
}

async fn return_checkout(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ReturnRequest>,
) -> Result<Json<CheckoutSummary>, AppError> {
    let summary = state
        .broker
        .return_checkout(&identity, body.checkout_id)
        .await?;
    Ok(Json(summary))
}

async fn active(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ActiveResponse>, AppError> {
    let checkouts = state.broker.list_active_checkouts(&identity).await?;
    Ok(Json(ActiveResponse { checkouts }))
}
