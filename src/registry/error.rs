//! Registry error taxonomy.
//!
//! Handler failures map to a small set of statuses with machine-readable
//! `error` codes. Raw tokens, signatures, and key material never appear in
//! a response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use super::store::StoreError;

/// Registry/CA surface errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Missing or invalid session/token.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed: scope gate failed, ownership
    /// mismatch, or token-auth on a session-only route.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// No such user/agent/certificate.
    #[error("not found")]
    NotFound,

    /// Uniqueness or cap violation, e.g. active-certificate cap.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Per-user or per-agent issuance cap exceeded.
    #[error("too many requests")]
    TooManyRequests,

    /// Malformed input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Feature not configured, e.g. CA routes without a CA.
    #[error("not implemented")]
    NotImplemented,

    /// Backend failure. Fail-closed.
    #[error("unavailable")]
    Unavailable,

    /// Anything else.
    #[error("internal error")]
    Internal,
}

impl RegistryError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::TooManyRequests => "TooManyRequests",
            Self::BadRequest(_) => "BadRequest",
            Self::NotImplemented => "NotImplemented",
            Self::Unavailable => "Unavailable",
            Self::Internal => "Internal",
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(detail) => Self::Conflict(detail),
            StoreError::Unavailable(_) => Self::Unavailable,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let detail = match &self {
            Self::BadRequest(d) => Some(d.clone()),
            Self::Conflict(d) => Some(d.clone()),
            Self::Forbidden(d) => Some((*d).to_string()),
            _ => None,
        };
        let body = match detail {
            Some(detail) => json!({"error": self.code(), "detail": detail}),
            None => json!({"error": self.code()}),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(RegistryError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RegistryError::Forbidden("scope").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(RegistryError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RegistryError::Conflict("cap".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RegistryError::TooManyRequests.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn store_errors_map_through() {
        assert_eq!(
            RegistryError::from(StoreError::NotFound),
            RegistryError::NotFound
        );
        assert_eq!(
            RegistryError::from(StoreError::Unavailable("kv".into())),
            RegistryError::Unavailable
        );
    }
}
