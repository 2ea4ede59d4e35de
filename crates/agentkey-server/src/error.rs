//! HTTP error types for the Agent Key server.
//!
//! Maps domain errors from `agentkey-core` into HTTP responses. Every error
//! variant produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use agentkey_core::error::{BrokerError, CheckoutError, ErrorClass, IdentityError};
use agentkey_core::policy_engine::DenialReason;

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Missing or invalid bearer token.
    #[error("{0}")]
    Unauthorized(String),
    /// The caller's role does not allow the operation.
    #[error("{0}")]
    Forbidden(String),
    /// Policy refused a checkout.
    #[error("checkout denied: {0}")]
    Denied(DenialReason),
    /// Requested resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Client sent invalid input.
    #[error("{0}")]
    BadRequest(String),
    /// A race or misuse, such as returning a checkout twice.
    #[error("{0}")]
    Conflict(String),
    /// Storage or key management is unavailable; the request may be retried.
    #[error("{0}")]
    Unavailable(String),
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_type) = match self {
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::Denied(DenialReason::TtlExceedsMax) => {
                (StatusCode::BAD_REQUEST, DenialReason::TtlExceedsMax.as_str())
            }
            Self::Denied(reason) => (StatusCode::FORBIDDEN, reason.as_str()),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl AppError {
    fn classified(class: ErrorClass, message: String) -> Self {
        match class {
            ErrorClass::Denial => Self::Forbidden(message),
            ErrorClass::Conflict => Self::Conflict(message),
            ErrorClass::NotFound => Self::NotFound(message),
            ErrorClass::Invalid => Self::BadRequest(message),
            ErrorClass::Transient => Self::Unavailable(message),
            ErrorClass::Invariant => {
                error!(error = %message, "invariant violation");
                Self::Internal(message)
            }
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Checkout(CheckoutError::Denied(reason)) => Self::Denied(reason),
            BrokerError::Forbidden { .. } => Self::Forbidden(err.to_string()),
            _ => Self::classified(err.class(), err.to_string()),
        }
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err.class() {
            ErrorClass::Denial | ErrorClass::NotFound => {
                Self::Unauthorized("invalid or revoked token".to_owned())
            }
            class => Self::classified(class, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use agentkey_core::checkout::CheckoutState;
    use agentkey_core::error::VaultError;
    use agentkey_core::identity::Role;
    use agentkey_core::ids::{CheckoutId, SecretId};

    use super::*;

    fn status(err: BrokerError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn denials_are_forbidden_except_ttl() {
        assert_eq!(
            status(BrokerError::Checkout(CheckoutError::Denied(
                DenialReason::RateLimitExceeded
            ))),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(BrokerError::Checkout(CheckoutError::Denied(
                DenialReason::TtlExceedsMax
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(BrokerError::Forbidden {
                required: Role::Admin
            }),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn classes_map_to_statuses() {
        assert_eq!(
            status(BrokerError::Checkout(CheckoutError::AlreadyTerminal {
                checkout_id: CheckoutId::new(),
                state: CheckoutState::Returned,
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(BrokerError::Vault(VaultError::NotFound {
                secret_id: SecretId::new(),
            })),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(BrokerError::Vault(VaultError::KmsTimeout { timeout_ms: 10 })),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(BrokerError::Checkout(CheckoutError::Invariant {
                reason: "x".to_owned(),
            })),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_tokens_are_unauthorized() {
        let resp = AppError::from(IdentityError::InvalidCredential).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
