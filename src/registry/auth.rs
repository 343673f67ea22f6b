//! Registry authentication: session cookies and personal access tokens.
//!
//! # Resolution order
//!
//! A `Bearer oba_…` Authorization header, when present, **owns** the
//! response - a bad token is a 401, it never falls through to the cookie.
//! Without a bearer token, the session cookie is consulted. Mixed auth in a
//! single request is therefore impossible by construction.
//!
//! # Cookies
//!
//! The session cookie value is `{session_id}.{hmac_sha256_hex}`; the MAC is
//! keyed with the configured session secret, so a forged id fails before
//! any store lookup. HttpOnly, SameSite=Lax, Secure in production.
//!
//! # Scopes
//!
//! Token principals carry the token's scope set; session principals carry
//! all scopes. Scope checks are route-layer middleware; session-only routes
//! (token management) reject token principals with 403.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::LazyLock;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, KeyInit, Mac};
use rand::{Rng, RngExt};
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::RegistryError;
use super::model::{Scope, Session, User};
use super::store::RegistryStore;

type HmacSha256 = Hmac<Sha256>;
type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^oba_[0-9a-f]{64}$").expect("static regex"));

/// How the principal authenticated.
#[derive(Debug, Clone)]
pub enum AuthVia {
    /// Cookie-bound session. Carries all scopes.
    Session {
        /// The backing session id.
        session_id: String,
    },
    /// Personal access token with its scope set.
    Token {
        /// The backing token id.
        token_id: Uuid,
        /// Scopes granted to the token.
        scopes: Vec<Scope>,
    },
}

/// The authenticated caller, injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    /// The authenticated user.
    pub user: User,
    /// Authentication mechanism.
    pub via: AuthVia,
}

impl AuthPrincipal {
    /// Whether this principal may exercise `scope`. Session identity has
    /// all scopes.
    #[must_use]
    pub fn allows(&self, scope: Scope) -> bool {
        match &self.via {
            AuthVia::Session { .. } => true,
            AuthVia::Token { scopes, .. } => scopes.contains(&scope),
        }
    }

    /// Whether this principal authenticated with a token.
    #[must_use]
    pub fn is_token(&self) -> bool {
        matches!(self.via, AuthVia::Token { .. })
    }
}

/// Extractor for routes that serve both anonymous and authenticated
/// callers: the resolved principal when one authenticated, else `None`.
pub struct MaybePrincipal(pub Option<AuthPrincipal>);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for MaybePrincipal {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthPrincipal>().cloned()))
    }
}

/// Enforce `scope` for a resolved principal.
pub fn ensure_scope(principal: &AuthPrincipal, scope: Scope) -> Result<(), RegistryError> {
    if principal.allows(scope) {
        Ok(())
    } else {
        Err(RegistryError::Forbidden("missing scope"))
    }
}

/// Reject token principals on session-only routes.
pub fn ensure_session_auth(principal: &AuthPrincipal) -> Result<(), RegistryError> {
    if principal.is_token() {
        Err(RegistryError::Forbidden("session authentication required"))
    } else {
        Ok(())
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Session issuance and cookie codec.
#[derive(Clone)]
pub struct SessionManager {
    secret: Vec<u8>,
    cookie_name: String,
    ttl: Duration,
    secure: bool,
}

impl SessionManager {
    /// Create a manager. `secret` keys the cookie MAC.
    #[must_use]
    pub fn new(secret: &str, cookie_name: &str, ttl_days: i64, secure: bool) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            cookie_name: cookie_name.to_string(),
            ttl: Duration::days(ttl_days),
            secure,
        }
    }

    /// The cookie name.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a new session record for `user_id`.
    #[must_use]
    pub fn mint(&self, user_id: Uuid) -> Session {
        let raw: [u8; 32] = rand::rng().random();
        let now = Utc::now();
        Session {
            id: URL_SAFE_NO_PAD.encode(raw),
            user_id,
            created_at: now,
            expires_at: now + self.ttl,
        }
    }

    /// The `Set-Cookie` value binding `session`.
    #[must_use]
    pub fn set_cookie(&self, session: &Session) -> String {
        let value = format!("{}.{}", session.id, self.mac_hex(&session.id));
        let max_age = self.ttl.num_seconds();
        let mut cookie = format!(
            "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
            self.cookie_name
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// The `Set-Cookie` value clearing the session cookie.
    #[must_use]
    pub fn clear_cookie(&self) -> String {
        format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            self.cookie_name
        )
    }

    /// Validate a cookie value; returns the session id when the MAC holds.
    #[must_use]
    pub fn verify_cookie_value(&self, value: &str) -> Option<String> {
        let (id, mac) = value.rsplit_once('.')?;
        let expected = self.mac_hex(id);
        if bool::from(expected.as_bytes().ct_eq(mac.as_bytes())) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn mac_hex(&self, session_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key len");
        mac.update(session_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Shared state for the authentication middleware.
pub struct AuthState {
    /// The registry store.
    pub store: Arc<dyn RegistryStore>,
    /// Session manager.
    pub sessions: SessionManager,
    /// Per-IP limiter for failed token authentication.
    failed_auth: IpLimiter,
}

impl AuthState {
    /// Assemble auth state. `failed_auth_per_minute` bounds invalid bearer
    /// attempts per client IP.
    #[must_use]
    pub fn new(
        store: Arc<dyn RegistryStore>,
        sessions: SessionManager,
        failed_auth_per_minute: u32,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(failed_auth_per_minute).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            store,
            sessions,
            failed_auth: RateLimiter::keyed(quota),
        }
    }
}

/// Resolve the caller identity and stash it in request extensions.
///
/// Routes decide with [`require_auth`] / [`scope_guard`] whether an
/// anonymous caller is acceptable.
pub async fn authenticate(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    if let Some(token) = bearer {
        // Token auth owns the response.
        let ip = client_ip(&request);
        match resolve_token(&state, &token).await {
            Ok(principal) => {
                request.extensions_mut().insert(principal);
                return next.run(request).await;
            }
            Err(e) => {
                // Only failures are charged against the per-IP budget.
                if state.failed_auth.check_key(&ip).is_err() {
                    warn!(ip = %ip, "Failed token auth rate limit exceeded");
                    return RegistryError::TooManyRequests.into_response();
                }
                debug!(ip = %ip, "Token authentication failed");
                return e.into_response();
            }
        }
    }

    if let Some(principal) = resolve_session(&state, &request).await {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

/// Reject unauthenticated requests with 401.
pub async fn require_auth(request: Request<Body>, next: Next) -> Response {
    if request.extensions().get::<AuthPrincipal>().is_none() {
        return RegistryError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// Route-layer scope gate. Session principals pass unconditionally.
pub async fn scope_guard(scope: Scope, request: Request<Body>, next: Next) -> Response {
    let Some(principal) = request.extensions().get::<AuthPrincipal>() else {
        return RegistryError::Unauthorized.into_response();
    };
    if let Err(e) = ensure_scope(principal, scope) {
        return e.into_response();
    }
    next.run(request).await
}

/// Route-layer gate for session-only routes (token management).
pub async fn session_only_guard(request: Request<Body>, next: Next) -> Response {
    let Some(principal) = request.extensions().get::<AuthPrincipal>() else {
        return RegistryError::Unauthorized.into_response();
    };
    if let Err(e) = ensure_session_auth(principal) {
        return e.into_response();
    }
    next.run(request).await
}

async fn resolve_token(state: &AuthState, token: &str) -> Result<AuthPrincipal, RegistryError> {
    if !TOKEN_RE.is_match(token) {
        return Err(RegistryError::Unauthorized);
    }

    let presented_hash = hex::encode(Sha256::digest(token.as_bytes()));
    let record = state
        .store
        .token_by_hash(&presented_hash)
        .await
        .ok_or(RegistryError::Unauthorized)?;

    // The hash indexed the lookup; compare again in constant time before
    // trusting the record.
    if !bool::from(
        record
            .token_hash
            .as_bytes()
            .ct_eq(presented_hash.as_bytes()),
    ) {
        return Err(RegistryError::Unauthorized);
    }
    if record.is_expired(Utc::now()) {
        return Err(RegistryError::Unauthorized);
    }

    let user = state
        .store
        .get_user(record.user_id)
        .await
        .map_err(|_| RegistryError::Unauthorized)?;
    if user.disabled {
        return Err(RegistryError::Unauthorized);
    }

    // Last-used bookkeeping happens off the request path.
    let store = Arc::clone(&state.store);
    let token_id = record.id;
    tokio::spawn(async move {
        store.touch_token(token_id, Utc::now()).await;
    });

    Ok(AuthPrincipal {
        user,
        via: AuthVia::Token {
            token_id: record.id,
            scopes: record.scopes,
        },
    })
}

async fn resolve_session(state: &AuthState, request: &Request<Body>) -> Option<AuthPrincipal> {
    let cookie_value = cookie_from_request(request, state.sessions.cookie_name())?;
    let session_id = state.sessions.verify_cookie_value(&cookie_value)?;
    let session = state.store.get_session(&session_id).await?;
    let user = state.store.get_user(session.user_id).await.ok()?;
    if user.disabled {
        return None;
    }
    Some(AuthPrincipal {
        user,
        via: AuthVia::Session {
            session_id: session.id,
        },
    })
}

fn cookie_from_request(request: &Request<Body>, name: &str) -> Option<String> {
    let header = request.headers().get("cookie")?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

fn client_ip(request: &Request<Body>) -> IpAddr {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

// ── Token generation ──────────────────────────────────────────────────────────

/// A freshly generated raw token plus its storage form.
pub struct GeneratedToken {
    /// The raw bearer value, returned to the caller exactly once.
    pub raw: String,
    /// SHA-256 hex of the raw value.
    pub hash: String,
    /// Display prefix `oba_XXXX`.
    pub prefix: String,
}

/// Generate a personal access token: 32 CSPRNG bytes, hex, `oba_` prefix.
#[must_use]
pub fn generate_token() -> GeneratedToken {
    let bytes: [u8; 32] = rand::rng().random();
    let raw = format!("oba_{}", hex::encode(bytes));
    let hash = hex::encode(Sha256::digest(raw.as_bytes()));
    let prefix = format!("oba_{}", &raw[4..8]);
    GeneratedToken { raw, hash, prefix }
}

/// Whether a bearer value is shaped like a registry token.
#[must_use]
pub fn is_token_format(value: &str) -> bool {
    TOKEN_RE.is_match(value)
}
