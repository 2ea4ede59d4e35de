//! Bootstrap route: `POST /v1/bootstrap`
//!
//! Creates the first tenant and its administrator token. Refused once any
//! tenant exists, and not served at all when disabled by configuration.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use agentkey_core::ids::{ActorId, TenantId};

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/v1/bootstrap` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(bootstrap))
}

/// Request body for `POST /v1/bootstrap`.
#[derive(Debug, Deserialize)]
pub struct BootstrapRequest {
    pub tenant_name: String,
    pub admin_name: String,
}

/// Response body for `POST /v1/bootstrap`.
#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub admin_id: ActorId,
    /// The administrator's bearer token. Shown once.
    pub admin_token: String,
}

async fn bootstrap(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BootstrapRequest>,
) -> Result<(StatusCode, Json<BootstrapResponse>), AppError> {
    if !state.bootstrap_enabled {
        return Err(AppError::NotFound("bootstrap is disabled".to_owned()));
    }

    let boot = state
        .broker
        .bootstrap(&body.tenant_name, &body.admin_name)
        .await?;
    info!(tenant_id = %boot.tenant.id, "tenant bootstrapped over HTTP");

    Ok((
        StatusCode::CREATED,
        Json(BootstrapResponse {
            tenant_id: boot.tenant.id,
            tenant_name: boot.tenant.name,
            admin_id: boot.admin.actor.id,
            admin_token: boot.admin.token,
        }),
    ))
}
