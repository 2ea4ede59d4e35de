//! Agent Key HTTP server library.
//!
//! Exposes the server's building blocks so the binary and tests can share
//! them: configuration, application state, error mapping, authentication
//! middleware, routes, the expiry sweep, and process hardening.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod sweep;
