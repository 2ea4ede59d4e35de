//! HTTP route handlers for Agent Key.
//!
//! Routes are organized by caller:
//! - `sys`: health check (unauthenticated)
//! - `bootstrap`: one-time tenant creation (unauthenticated)
//! - `credentials`: agent checkout, return, and active listing
//! - `admin`: secrets, policies, checkouts, audit, and agents

pub mod admin;
pub mod bootstrap;
pub mod credentials;
pub mod sys;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::http::header::{CACHE_CONTROL, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::middleware as axum_mw;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::auth_middleware;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let authenticated_routes = Router::new()
        .nest("/v1/credentials", credentials::router())
        .nest("/v1/admin", admin::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    // Bootstrap is unauthenticated; bound how many run at once.
    let bootstrap_routes = Router::new()
        .nest("/v1/bootstrap", bootstrap::router())
        .layer(ConcurrencyLimitLayer::new(4));

    Router::new()
        .nest("/v1/sys", sys::router())
        .merge(bootstrap_routes)
        .merge(authenticated_routes)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
