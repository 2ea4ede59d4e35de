//! Authentication middleware for Agent Key.
//!
//! Extracts the bearer token from the `Authorization` header, resolves it
//! through the broker's identity resolver, and injects the resulting
//! [`Identity`] into the request extensions for handlers to use.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use agentkey_core::identity::{Identity, IdentityResolver};

use crate::error::AppError;
use crate::state::AppState;

fn bearer_token(req: &Request) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_owned())
    } else {
        None
    }
}

/// Middleware that requires a valid `Authorization: Bearer` token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&req) else {
        return AppError::Unauthorized("missing bearer token".to_owned()).into_response();
    };

    match state.broker.identities().verify(&token).await {
        Ok(identity) => {
            debug!(actor_id = %identity.actor, role = %identity.role, "authenticated");
            req.extensions_mut().insert::<Identity>(identity);
            next.run(req).await
        }
        Err(e) => AppError::from(e).into_response(),
    }
}
