//! Verifier HTTP surface.
//!
//! - `POST /verify` - pure verification; always 200 with a decision body.
//! - `POST /authorize` - edge auth-request hook; 401/429 on deny, trust
//!   headers on allow.
//! - `POST /cache/jwks/clear`, `POST /cache/nonces/clear` - admin purge.
//! - `GET /health` - liveness plus KV status.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer,
};
use tracing::{info, warn};

use super::engine::{SignedRequest, VerifierEngine};
use super::error::VerifyError;
use crate::{Error, Result};

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Rate-limit settings for the verification endpoints.
#[derive(Debug, Clone)]
pub struct VerifierLimits {
    /// Requests per second per client IP.
    pub requests_per_second: u32,
    /// Burst allowance per client IP.
    pub burst: u32,
}

impl Default for VerifierLimits {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst: 100,
        }
    }
}

/// Shared router state.
pub struct VerifierState {
    /// The verification engine.
    pub engine: Arc<VerifierEngine>,
    /// Bearer token required on admin routes; admin routes are disabled
    /// when unset.
    pub admin_token: Option<String>,
    limiter: IpLimiter,
}

impl VerifierState {
    /// Assemble router state.
    #[must_use]
    pub fn new(
        engine: Arc<VerifierEngine>,
        admin_token: Option<String>,
        limits: &VerifierLimits,
    ) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(limits.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(limits.burst).unwrap_or(NonZeroU32::MIN));
        Self {
            engine,
            admin_token,
            limiter: RateLimiter::keyed(quota),
        }
    }
}

/// Build the verifier router.
pub fn create_router(state: Arc<VerifierState>) -> Router {
    Router::new()
        .route("/verify", post(verify_handler))
        .route("/authorize", post(authorize_handler))
        .route("/cache/jwks/clear", post(clear_jwks_handler))
        .route("/cache/nonces/clear", post(clear_nonces_handler))
        .route("/health", get(health_handler))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the verifier until SIGTERM/ctrl-c.
pub async fn serve(state: Arc<VerifierState>, addr: SocketAddr) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    state
        .engine
        .nonce_cache()
        .spawn_reaper(Duration::from_secs(60), shutdown_tx.subscribe());

    let app = create_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Verifier listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Verifier shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

// ── Request/response bodies ───────────────────────────────────────────────────

/// Body of `/verify` and `/authorize`. Header values may be a string or an
/// array of strings.
#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    /// HTTP method of the request under verification.
    pub method: String,
    /// Absolute target URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, serde_json::Value>,
}

impl VerifyBody {
    fn into_signed_request(self) -> SignedRequest {
        let mut headers = Vec::new();
        for (name, value) in self.headers {
            match value {
                serde_json::Value::Array(values) => {
                    for v in values {
                        if let Some(s) = v.as_str() {
                            headers.push((name.clone(), s.to_string()));
                        }
                    }
                }
                serde_json::Value::String(s) => headers.push((name, s)),
                other => headers.push((name, other.to_string())),
            }
        }
        SignedRequest {
            method: self.method,
            url: self.url,
            headers,
        }
    }
}

/// Decision body returned by both endpoints.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    /// Whether the signature verified.
    pub verified: bool,
    /// Agent identity on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<super::engine::AgentIdentity>,
    /// Machine-readable failure code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    /// Signature creation time on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    /// Effective expiry on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// POST /verify - decision with HTTP 200 for both outcomes.
async fn verify_handler(
    State(state): State<Arc<VerifierState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Response {
    if let Err(response) = check_rate(&state, &headers, addr) {
        return response;
    }

    let request = body.into_signed_request();
    match state.engine.verify(&request).await {
        Ok(v) => Json(VerifyResponse {
            verified: true,
            agent: Some(v.agent),
            error: None,
            created: Some(v.created),
            expires: Some(v.expires),
        })
        .into_response(),
        Err(e) => Json(VerifyResponse {
            verified: false,
            agent: None,
            error: Some(e.code()),
            created: None,
            expires: None,
        })
        .into_response(),
    }
}

/// POST /authorize - edge hook; trust headers on allow, status on deny.
async fn authorize_handler(
    State(state): State<Arc<VerifierState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Response {
    if let Err(response) = check_rate(&state, &headers, addr) {
        return response;
    }

    let request = body.into_signed_request();
    match state.engine.verify(&request).await {
        Ok(v) => {
            let mut response = Json(VerifyResponse {
                verified: true,
                agent: Some(v.agent.clone()),
                error: None,
                created: Some(v.created),
                expires: Some(v.expires),
            })
            .into_response();
            let headers = response.headers_mut();
            headers.insert("X-OBAuth-Verified", "true".parse().expect("static"));
            if let Ok(kid) = v.agent.kid.parse() {
                headers.insert("X-OBAuth-Agent-KID", kid);
            }
            if let Ok(jwks) = v.agent.jwks_url.parse() {
                headers.insert("X-OBAuth-Agent-JWKS", jwks);
            }
            response
        }
        Err(e) => deny_response(&e),
    }
}

fn deny_response(error: &VerifyError) -> Response {
    let mut response = (
        error.status(),
        Json(VerifyResponse {
            verified: false,
            agent: None,
            error: Some(error.code()),
            created: None,
            expires: None,
        }),
    )
        .into_response();
    if *error == VerifyError::RateLimited {
        response
            .headers_mut()
            .insert("Retry-After", "1".parse().expect("static"));
    }
    response
}

/// Pick the client IP: first `X-Forwarded-For` entry, else the socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

fn check_rate(
    state: &VerifierState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> std::result::Result<(), Response> {
    let ip = client_ip(headers, addr);
    if state.limiter.check_key(&ip).is_ok() {
        Ok(())
    } else {
        warn!(ip = %ip, "Verification rate limit exceeded");
        Err(deny_response(&VerifyError::RateLimited))
    }
}

/// Admin gate: constant-time bearer comparison. Disabled (always 403) when
/// no admin token is configured.
fn require_admin(state: &VerifierState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let Some(ref expected) = state.admin_token else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "admin routes disabled"})),
        )
            .into_response());
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response()),
    }
}

/// POST /cache/jwks/clear
async fn clear_jwks_handler(
    State(state): State<Arc<VerifierState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    state.engine.jwks_cache().clear();
    info!("JWKS cache cleared by admin");
    Json(json!({"cleared": true})).into_response()
}

/// POST /cache/nonces/clear
async fn clear_nonces_handler(
    State(state): State<Arc<VerifierState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    state.engine.nonce_cache().clear();
    info!("Nonce cache cleared by admin");
    Json(json!({"cleared": true})).into_response()
}

/// GET /health
async fn health_handler(State(_state): State<Arc<VerifierState>>) -> Response {
    // The KV stores are in-process; report them the way the wire contract
    // expects.
    Json(json!({
        "status": "ok",
        "service": "openbotauth-verifier",
        "redis": "connected",
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::jwks_cache::{JwksCache, JwksCacheConfig, HttpDirectoryFetcher};
    use crate::verifier::nonce::NonceCache;
    use crate::verifier::engine::VerifierPolicy;

    fn state(admin: Option<&str>) -> VerifierState {
        let jwks = Arc::new(JwksCache::new(
            Arc::new(HttpDirectoryFetcher::new(Duration::from_secs(5))),
            JwksCacheConfig::default(),
        ));
        let engine = Arc::new(VerifierEngine::new(
            VerifierPolicy::default(),
            jwks,
            Arc::new(NonceCache::new()),
        ));
        VerifierState::new(engine, admin.map(String::from), &VerifierLimits::default())
    }

    #[test]
    fn admin_disabled_when_no_token() {
        let state = state(None);
        let headers = HeaderMap::new();
        assert!(require_admin(&state, &headers).is_err());
    }

    #[test]
    fn admin_accepts_exact_bearer() {
        let state = state(Some("sekrit"));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sekrit".parse().unwrap());
        assert!(require_admin(&state, &headers).is_ok());
    }

    #[test]
    fn admin_rejects_wrong_bearer() {
        let state = state(Some("sekrit"));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer nope".parse().unwrap());
        assert!(require_admin(&state, &headers).is_err());
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, addr), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.168.1.5:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, addr), "192.168.1.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn verify_body_flattens_array_headers() {
        let body: VerifyBody = serde_json::from_value(json!({
            "method": "GET",
            "url": "https://example.com/x",
            "headers": {
                "signature-agent": "https://d.example/jwks/a.json",
                "x-multi": ["a", "b"],
            }
        }))
        .unwrap();

        let request = body.into_signed_request();
        let multi: Vec<_> = request
            .headers
            .iter()
            .filter(|(k, _)| k == "x-multi")
            .collect();
        assert_eq!(multi.len(), 2);
    }
}
