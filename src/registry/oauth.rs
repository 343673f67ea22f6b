//! GitHub OAuth login and the CLI hand-off flow.
//!
//! The registry is an OAuth *client* of GitHub: `/auth/github` redirects to
//! GitHub's authorize page with a one-shot `state`, the callback exchanges
//! the code, loads the GitHub user, creates the account on first login,
//! and binds a session cookie.
//!
//! The CLI variant (`/auth/cli?port=…&state=…`) runs the same flow but
//! finishes by minting a full-scope personal access token and redirecting
//! to the CLI's loopback listener with the caller's `state` echoed back.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use rand::{Rng, RngExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::RegistryState;
use super::auth::{MaybePrincipal, generate_token};
use super::error::RegistryError;
use super::model::{ApiToken, Profile, Scope, User, is_valid_username};

/// Pending logins expire after ten minutes.
const STATE_TTL: StdDuration = StdDuration::from_secs(600);

/// GitHub OAuth client configuration plus in-flight login state.
pub struct GithubOauth {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
    pending: DashMap<String, PendingLogin>,
}

struct PendingLogin {
    started: Instant,
    cli: Option<CliHandoff>,
    redirect: Option<String>,
}

struct CliHandoff {
    port: u16,
    state: String,
}

/// GitHub token-exchange response.
#[derive(Debug, Deserialize)]
struct TokenExchange {
    access_token: Option<String>,
}

/// The subset of the GitHub user document we use.
#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    avatar_url: Option<String>,
}

impl GithubOauth {
    /// Create the client.
    #[must_use]
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(10))
                .build()
                .unwrap_or_default(),
            pending: DashMap::new(),
        }
    }

    fn begin(&self, cli: Option<CliHandoff>, redirect: Option<String>) -> String {
        // Drop stale states opportunistically.
        self.pending
            .retain(|_, p| p.started.elapsed() < STATE_TTL);

        let raw: [u8; 24] = rand::rng().random();
        let state = URL_SAFE_NO_PAD.encode(raw);
        self.pending.insert(
            state.clone(),
            PendingLogin {
                started: Instant::now(),
                cli,
                redirect,
            },
        );
        state
    }

    fn take(&self, state: &str) -> Option<PendingLogin> {
        let (_, pending) = self.pending.remove(state)?;
        (pending.started.elapsed() < STATE_TTL).then_some(pending)
    }

    fn authorize_url(&self, callback: &str, state: &str) -> String {
        format!(
            "https://github.com/login/oauth/authorize?client_id={}&redirect_uri={}&state={state}&scope=read:user",
            self.client_id,
            urlencode(callback),
        )
    }

    async fn exchange_code(&self, code: &str, callback: &str) -> Result<String, RegistryError> {
        let response = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", callback),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "GitHub code exchange failed");
                RegistryError::Unavailable
            })?;

        let exchange: TokenExchange = response.json().await.map_err(|_| RegistryError::Unavailable)?;
        exchange.access_token.ok_or(RegistryError::Unauthorized)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<GithubUser, RegistryError> {
        self.http
            .get("https://api.github.com/user")
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .header(header::USER_AGENT, "openbotauth-registry")
            .send()
            .await
            .map_err(|_| RegistryError::Unavailable)?
            .json()
            .await
            .map_err(|_| RegistryError::Unavailable)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Query of `/auth/github`.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Where to land after login; defaults to the configured redirect.
    pub redirect: Option<String>,
}

/// Query of `/auth/cli`.
#[derive(Debug, Deserialize)]
pub struct CliQuery {
    /// Loopback port the CLI listens on.
    pub port: u16,
    /// Caller-chosen state echoed back to the CLI.
    pub state: String,
}

/// Query of `/auth/github/callback`.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code.
    pub code: String,
    /// The state issued at login start.
    pub state: String,
}

fn require_oauth(state: &RegistryState) -> Result<&GithubOauth, RegistryError> {
    state.oauth.as_ref().ok_or(RegistryError::NotImplemented)
}

fn callback_url(state: &RegistryState) -> String {
    format!(
        "{}/auth/github/callback",
        state.settings.public_base_url.trim_end_matches('/')
    )
}

/// GET /auth/github - start the browser flow.
pub async fn github_login_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, RegistryError> {
    let oauth = require_oauth(&state)?;
    let login_state = oauth.begin(None, query.redirect);
    let url = oauth.authorize_url(&callback_url(&state), &login_state);
    Ok(Redirect::temporary(&url).into_response())
}

/// GET /auth/cli - start the CLI loopback flow.
pub async fn cli_login_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<CliQuery>,
) -> Result<Response, RegistryError> {
    let oauth = require_oauth(&state)?;
    if query.port < 1024 {
        return Err(RegistryError::BadRequest(
            "port must be unprivileged".to_string(),
        ));
    }
    let login_state = oauth.begin(
        Some(CliHandoff {
            port: query.port,
            state: query.state,
        }),
        None,
    );
    let url = oauth.authorize_url(&callback_url(&state), &login_state);
    Ok(Redirect::temporary(&url).into_response())
}

/// GET /auth/github/callback - finish either flow.
pub async fn github_callback_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, RegistryError> {
    let oauth = require_oauth(&state)?;
    let pending = oauth.take(&query.state).ok_or(RegistryError::Unauthorized)?;

    let access_token = oauth
        .exchange_code(&query.code, &callback_url(&state))
        .await?;
    let github_user = oauth.fetch_user(&access_token).await?;

    let user = find_or_create_user(&state, &github_user).await?;
    if user.disabled {
        return Err(RegistryError::Forbidden("account disabled"));
    }

    let session = state.auth.sessions.mint(user.id);
    state.store.create_session(session.clone()).await?;
    let cookie = state.auth.sessions.set_cookie(&session);
    info!(user = %user.id, handle = %user.handle, "Login complete");

    if let Some(cli) = pending.cli {
        // The CLI cannot read the cookie; hand it a PAT instead.
        let token = mint_cli_token(&state, user.id).await?;
        let target = format!(
            "http://127.0.0.1:{}/callback?state={}&token={token}",
            cli.port,
            urlencode(&cli.state),
        );
        let mut response = Redirect::temporary(&target).into_response();
        append_cookie(&mut response, &cookie);
        return Ok(response);
    }

    let target = pending
        .redirect
        .unwrap_or_else(|| state.settings.post_login_redirect.clone());
    let mut response = Redirect::temporary(&target).into_response();
    append_cookie(&mut response, &cookie);
    Ok(response)
}

/// GET /auth/session - who am I.
pub async fn session_info_handler(
    State(state): State<Arc<RegistryState>>,
    MaybePrincipal(principal): MaybePrincipal,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let Some(principal) = principal else {
        return Err(RegistryError::Unauthorized);
    };
    let profile = state.store.profile_by_user(principal.user.id).await;
    Ok(Json(json!({
        "user": {
            "id": principal.user.id,
            "handle": principal.user.handle,
            "avatar_url": principal.user.avatar_url,
        },
        "username": profile.map(|p| p.username),
        "token_auth": principal.is_token(),
    })))
}

/// POST /auth/logout
pub async fn logout_handler(
    State(state): State<Arc<RegistryState>>,
    MaybePrincipal(principal): MaybePrincipal,
) -> Response {
    if let Some(principal) = principal {
        if let super::auth::AuthVia::Session { session_id } = &principal.via {
            state.store.delete_session(session_id).await;
        }
    }
    let mut response = (StatusCode::OK, Json(json!({"logged_out": true}))).into_response();
    append_cookie(&mut response, &state.auth.sessions.clear_cookie());
    response
}

async fn find_or_create_user(
    state: &RegistryState,
    github_user: &GithubUser,
) -> Result<User, RegistryError> {
    let provider_id = github_user.id.to_string();
    if let Some(user) = state
        .store
        .find_user_by_provider("github", &provider_id)
        .await
    {
        return Ok(user);
    }

    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        provider: "github".to_string(),
        provider_id,
        handle: github_user.login.clone(),
        avatar_url: github_user.avatar_url.clone(),
        disabled: false,
        created_at: now,
        updated_at: now,
    };
    state.store.create_user(user.clone()).await?;

    // First login seeds the profile; username collisions get a numeric
    // suffix.
    let base = sanitize_username(&github_user.login);
    let mut username = base.clone();
    for attempt in 2..=20u32 {
        let profile = Profile {
            user_id: user.id,
            username: username.clone(),
            client_name: Some(github_user.login.clone()),
            client_uri: None,
            logo_uri: user.avatar_url.clone(),
            contacts: vec![],
            expected_user_agent: None,
            rfc9309_product_token: None,
            rfc9309_compliance: vec![],
            trigger: None,
            purpose: None,
            targeted_content: None,
            rate_control: None,
            rate_expectation: None,
            known_urls: vec![],
            is_public: false,
            updated_at: now,
        };
        match state.store.upsert_profile(profile).await {
            Ok(()) => {
                info!(user = %user.id, username = %username, "Account created");
                return Ok(user);
            }
            Err(_) => username = format!("{base}-{attempt}"),
        }
    }
    Err(RegistryError::Conflict("username space exhausted".to_string()))
}

fn sanitize_username(login: &str) -> String {
    let cleaned: String = login
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(39)
        .collect();
    if is_valid_username(&cleaned) {
        cleaned
    } else {
        format!("user-{}", &Uuid::new_v4().simple().to_string()[..8])
    }
}

async fn mint_cli_token(state: &RegistryState, user_id: Uuid) -> Result<String, RegistryError> {
    let generated = generate_token();
    let now = Utc::now();
    let token = ApiToken {
        id: Uuid::new_v4(),
        user_id,
        name: "cli".to_string(),
        token_hash: generated.hash,
        prefix: generated.prefix,
        scopes: Scope::ALL.to_vec(),
        expires_at: now + Duration::days(30),
        last_used_at: None,
        created_at: now,
    };
    state.store.insert_token(token).await?;
    Ok(generated.raw)
}

fn append_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = cookie.parse() {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved() {
        assert_eq!(urlencode("https://a.example/cb?x=1"), "https%3A%2F%2Fa.example%2Fcb%3Fx%3D1");
        assert_eq!(urlencode("plain-text_1.2~3"), "plain-text_1.2~3");
    }

    #[test]
    fn sanitize_username_filters_and_falls_back() {
        assert_eq!(sanitize_username("Alice-99"), "Alice-99");
        assert_eq!(sanitize_username("we!rd@login"), "werdlogin");
        assert!(sanitize_username("----").starts_with("user-"));
    }

    #[test]
    fn state_is_one_shot_and_expires() {
        let oauth = GithubOauth::new("id".into(), "secret".into());
        let state = oauth.begin(None, None);
        assert!(oauth.take(&state).is_some());
        assert!(oauth.take(&state).is_none(), "states are single-use");
    }

    #[test]
    fn authorize_url_carries_client_and_state() {
        let oauth = GithubOauth::new("my-client".into(), "secret".into());
        let url = oauth.authorize_url("https://reg.example/auth/github/callback", "st4te");
        assert!(url.contains("client_id=my-client"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Freg.example%2Fauth%2Fgithub%2Fcallback"));
    }
}
