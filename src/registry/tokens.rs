//! Personal-access-token management.
//!
//! All three routes are session-auth-only: a token cannot mint, list, or
//! delete tokens (the route layer rejects token principals with 403 before
//! these handlers run). Listing and deletion are additionally rate-limited
//! per user. The raw token appears exactly once, in the creation response,
//! under `Cache-Control: no-store`.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::RegistryState;
use super::auth::{AuthPrincipal, generate_token};
use super::error::RegistryError;
use super::model::{ApiToken, Scope, parse_scopes};

/// Expiry bounds, days.
const MIN_EXPIRY_DAYS: i64 = 1;
const MAX_EXPIRY_DAYS: i64 = 365;

type UserLimiter = RateLimiter<Uuid, DefaultKeyedStateStore<Uuid>, DefaultClock>;

/// Per-user rate limiter for token list/delete calls.
pub struct TokenOpsLimiter {
    inner: UserLimiter,
}

impl TokenOpsLimiter {
    /// Allow `per_minute` token-management calls per user per minute.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            inner: RateLimiter::keyed(quota),
        }
    }

    /// Charge one call for `user_id`.
    fn check(&self, user_id: Uuid) -> Result<(), RegistryError> {
        if self.inner.check_key(&user_id).is_ok() {
            Ok(())
        } else {
            warn!(user = %user_id, "Token management rate limit exceeded");
            Err(RegistryError::TooManyRequests)
        }
    }
}

/// Body of `POST /auth/tokens`.
#[derive(Debug, Deserialize)]
pub struct CreateTokenBody {
    /// Display name.
    pub name: String,
    /// Requested scopes, each from the closed set.
    pub scopes: Vec<String>,
    /// Expiry window in days, 1–365. Defaults to 30.
    pub expires_in_days: Option<i64>,
}

/// Creation response. The only place the raw token ever appears.
#[derive(Debug, Serialize)]
pub struct CreatedToken {
    /// Token id.
    pub id: Uuid,
    /// The raw bearer value. Shown once.
    pub token: String,
    /// Display prefix.
    pub prefix: String,
    /// Granted scopes.
    pub scopes: Vec<Scope>,
    /// Expiry.
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// POST /auth/tokens
pub async fn create_token_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<CreateTokenBody>,
) -> Result<Response, RegistryError> {
    if body.name.trim().is_empty() {
        return Err(RegistryError::BadRequest("name required".to_string()));
    }
    let scopes =
        parse_scopes(&body.scopes).map_err(RegistryError::BadRequest)?;
    if scopes.is_empty() {
        return Err(RegistryError::BadRequest(
            "at least one scope required".to_string(),
        ));
    }

    let days = body.expires_in_days.unwrap_or(30);
    if !(MIN_EXPIRY_DAYS..=MAX_EXPIRY_DAYS).contains(&days) {
        return Err(RegistryError::BadRequest(format!(
            "expires_in_days must be between {MIN_EXPIRY_DAYS} and {MAX_EXPIRY_DAYS}"
        )));
    }

    let existing = state.store.count_tokens(principal.user.id).await;
    if existing >= state.settings.max_tokens_per_user {
        return Err(RegistryError::TooManyRequests);
    }

    let generated = generate_token();
    let now = Utc::now();
    let token = ApiToken {
        id: Uuid::new_v4(),
        user_id: principal.user.id,
        name: body.name,
        token_hash: generated.hash,
        prefix: generated.prefix.clone(),
        scopes: scopes.clone(),
        expires_at: now + Duration::days(days),
        last_used_at: None,
        created_at: now,
    };
    state.store.insert_token(token.clone()).await?;
    info!(user = %principal.user.id, token = %token.id, "API token created");

    let body = CreatedToken {
        id: token.id,
        token: generated.raw,
        prefix: generated.prefix,
        scopes,
        expires_at: token.expires_at,
    };
    Ok((
        StatusCode::CREATED,
        [(header::CACHE_CONTROL, "no-store")],
        Json(body),
    )
        .into_response())
}

/// GET /auth/tokens - metadata only; hashes and raw values never reappear.
pub async fn list_tokens_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Json<Vec<ApiToken>>, RegistryError> {
    state.token_ops.check(principal.user.id)?;
    Ok(Json(state.store.tokens_by_user(principal.user.id).await))
}

/// DELETE /auth/tokens/{id}
pub async fn delete_token_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, RegistryError> {
    state.token_ops.check(principal.user.id)?;
    state.store.delete_token(principal.user.id, id).await?;
    info!(user = %principal.user.id, token = %id, "API token deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_admits_within_quota_then_rejects() {
        let limiter = TokenOpsLimiter::new(2);
        let user = Uuid::new_v4();

        assert!(limiter.check(user).is_ok());
        assert!(limiter.check(user).is_ok());
        assert_eq!(
            limiter.check(user).unwrap_err(),
            RegistryError::TooManyRequests
        );
    }

    #[test]
    fn limiter_buckets_are_per_user() {
        let limiter = TokenOpsLimiter::new(1);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert!(limiter.check(alice).is_ok());
        assert!(limiter.check(alice).is_err());
        // A throttled user does not consume anyone else's budget.
        assert!(limiter.check(bob).is_ok());
    }
}
