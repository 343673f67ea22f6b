//! Directory (JWKS) endpoints.
//!
//! `GET /jwks/{username}.json` assembles the user's Web-Bot-Auth directory:
//! active user keys, active-agent keys, certificate chains merged in by
//! kid, and legacy kid aliases. `GET /agent-jwks/{agent_id}` serves a
//! per-agent document, and `/.well-known/signature-agent-card` serves the
//! discovery card.
//!
//! User-level directories use the
//! `application/http-message-signatures-directory+json` media type;
//! agent-level documents stay `application/json`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::RegistryState;
use super::auth::MaybePrincipal;
use super::error::RegistryError;
use super::model::{Agent, AgentStatus, Profile};
use super::store::RegistryStore;
use crate::crypto::Jwk;

/// Directory media type (RFC 9421 HTTP message signature directories).
pub const DIRECTORY_CONTENT_TYPE: &str = "application/http-message-signatures-directory+json";

/// The served directory document.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryDocument {
    /// Display name; falls back to the username.
    pub client_name: String,
    /// Homepage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    /// Logo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    /// Contacts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<String>,
    /// Expected User-Agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_user_agent: Option<String>,
    /// RFC 9309 product token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfc9309_product_token: Option<String>,
    /// RFC 9309 compliance flags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rfc9309_compliance: Vec<String>,
    /// Crawl trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Crawl purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Targeted content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targeted_content: Option<String>,
    /// Rate control.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control: Option<String>,
    /// Rate expectation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_expectation: Option<String>,
    /// Known URLs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known_urls: Vec<String>,
    /// Known agent identities.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known_identities: Vec<String>,
    /// Registry vouches for this identity.
    pub verified: bool,
    /// The key set.
    pub keys: Vec<Jwk>,
}

/// Assemble a user's directory. Returns `None` for unknown users or users
/// without a single usable key.
pub async fn build_directory(
    store: &Arc<dyn RegistryStore>,
    username: &str,
) -> Option<DirectoryDocument> {
    let profile = store.profile_by_username(username).await?;
    let agents = store.agents_by_user(profile.user_id).await;

    let mut keys: Vec<Jwk> = Vec::new();
    let mut seen_kids: Vec<String> = Vec::new();

    // User-level keys: every active history row, latest first.
    for record in store.key_history(profile.user_id).await.iter().rev() {
        if !record.active {
            continue;
        }
        match Jwk::from_x(&record.x) {
            Ok(jwk) => push_deduped(&mut keys, &mut seen_kids, jwk),
            Err(e) => {
                warn!(user = %profile.user_id, error = %e, "Skipping malformed user key");
            }
        }
    }

    // Agent-level keys from active agents.
    let mut known_identities = Vec::new();
    for agent in &agents {
        if agent.status != AgentStatus::Active {
            continue;
        }
        if let Some(ref oba_id) = agent.oba_agent_id {
            known_identities.push(oba_id.clone());
        }
        let mut jwk = agent.jwk.clone();
        if jwk.kid.is_none() {
            jwk.kid = Some(jwk.thumbprint());
        }
        if jwk.verifying_key().is_err() {
            // Malformed agent JWK: skipped server-side, never surfaced.
            warn!(agent = %agent.id, "Skipping malformed agent JWK");
            continue;
        }
        push_deduped(&mut keys, &mut seen_kids, jwk);
    }

    if keys.is_empty() {
        return None;
    }

    // Certificate chains: (kid → x5c) for active certs owned by this user.
    let now = Utc::now();
    let mut chains: HashMap<String, Vec<String>> = HashMap::new();
    for cert in store.certificates_by_user(profile.user_id).await {
        if cert.is_active(now) {
            chains.entry(cert.kid.clone()).or_insert(cert.x5c);
        }
    }
    for jwk in &mut keys {
        if let Some(kid) = &jwk.kid {
            if let Some(x5c) = chains.get(kid) {
                jwk.x5c = Some(x5c.clone());
            }
        }
    }

    // Legacy kid aliases, so pre-thumbprint signatures keep verifying.
    let mut aliases = Vec::new();
    for jwk in &keys {
        if let Some(legacy) = jwk.legacy_id() {
            if !seen_kids.contains(&legacy) {
                let mut alias = jwk.clone();
                alias.kid = Some(legacy.clone());
                seen_kids.push(legacy);
                aliases.push(alias);
            }
        }
    }
    keys.extend(aliases);

    Some(document_for(&profile, known_identities, keys))
}

fn push_deduped(keys: &mut Vec<Jwk>, seen: &mut Vec<String>, mut jwk: Jwk) {
    if jwk.kid.is_none() {
        jwk.kid = Some(jwk.thumbprint());
    }
    let kid = jwk.kid.clone().unwrap_or_default();
    if seen.contains(&kid) {
        return;
    }
    seen.push(kid);
    keys.push(jwk);
}

fn document_for(
    profile: &Profile,
    known_identities: Vec<String>,
    keys: Vec<Jwk>,
) -> DirectoryDocument {
    DirectoryDocument {
        client_name: profile
            .client_name
            .clone()
            .unwrap_or_else(|| profile.username.clone()),
        client_uri: profile.client_uri.clone(),
        logo_uri: profile.logo_uri.clone(),
        contacts: profile.contacts.clone(),
        expected_user_agent: profile.expected_user_agent.clone(),
        rfc9309_product_token: profile.rfc9309_product_token.clone(),
        rfc9309_compliance: profile.rfc9309_compliance.clone(),
        trigger: profile.trigger.clone(),
        purpose: profile.purpose.clone(),
        targeted_content: profile.targeted_content.clone(),
        rate_control: profile.rate_control.clone(),
        rate_expectation: profile.rate_expectation.clone(),
        known_urls: profile.known_urls.clone(),
        known_identities,
        verified: true,
        keys,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /jwks/{username}.json
pub async fn user_directory_handler(
    State(state): State<Arc<RegistryState>>,
    Path(file): Path<String>,
) -> Response {
    let Some(username) = file.strip_suffix(".json") else {
        return RegistryError::NotFound.into_response();
    };
    match build_directory(&state.store, username).await {
        Some(document) => (
            [
                (header::CONTENT_TYPE, DIRECTORY_CONTENT_TYPE),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=3600, stale-while-revalidate=300",
                ),
            ],
            Json(document),
        )
            .into_response(),
        None => RegistryError::NotFound.into_response(),
    }
}

/// GET /agent-jwks/{agent_id} - per-agent key set, `application/json`.
pub async fn agent_directory_handler(
    State(state): State<Arc<RegistryState>>,
    Path(agent_id): Path<String>,
) -> Response {
    let Some(agent) = find_agent(&state.store, &agent_id).await else {
        return RegistryError::NotFound.into_response();
    };
    if agent.status != AgentStatus::Active {
        return RegistryError::NotFound.into_response();
    }

    let mut jwk = agent.jwk.clone();
    if jwk.kid.is_none() {
        jwk.kid = Some(jwk.thumbprint());
    }
    let profile = state.store.profile_by_user(agent.user_id).await;

    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(json!({
            "client_name": agent.name,
            "agent_type": agent.agent_type,
            "operator": profile.map(|p| p.username),
            "oba_agent_id": agent.oba_agent_id,
            "keys": [jwk],
        })),
    )
        .into_response()
}

/// Query parameters accepted by the agent card endpoint.
#[derive(Debug, Deserialize)]
pub struct CardQuery {
    /// Look up by agent identifier.
    pub agent_id: Option<String>,
    /// Look up by owner username.
    pub username: Option<String>,
}

/// GET /.well-known/signature-agent-card
///
/// Resolves by `agent_id`, `username`, or the authenticated session, in
/// that order.
pub async fn agent_card_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<CardQuery>,
    MaybePrincipal(principal): MaybePrincipal,
) -> Response {
    let agent = if let Some(ref agent_id) = query.agent_id {
        find_agent(&state.store, agent_id).await
    } else if let Some(ref username) = query.username {
        first_active_agent_for(&state.store, username).await
    } else if let Some(principal) = principal {
        state
            .store
            .agents_by_user(principal.user.id)
            .await
            .into_iter()
            .find(|a| a.status == AgentStatus::Active)
    } else {
        None
    };

    let Some(agent) = agent else {
        return RegistryError::NotFound.into_response();
    };

    let mut jwk = agent.jwk.clone();
    if jwk.kid.is_none() {
        jwk.kid = Some(jwk.thumbprint());
    }

    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(json!({
            "name": agent.name,
            "description": agent.description,
            "keys": [jwk],
            "oba_agent_id": agent.oba_agent_id,
            "oba_parent_agent_id": agent.oba_parent_agent_id,
            "oba_principal": agent.oba_principal,
        })),
    )
        .into_response()
}

/// GET /.well-known/ca.pem
pub async fn ca_pem_handler(State(state): State<Arc<RegistryState>>) -> Response {
    match &state.ca {
        Some(ca) => (
            [
                (header::CONTENT_TYPE, "application/x-pem-file"),
                (header::CACHE_CONTROL, "public, max-age=86400, immutable"),
            ],
            ca.ca_pem().to_string(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({"error": "NotImplemented"})),
        )
            .into_response(),
    }
}

async fn find_agent(store: &Arc<dyn RegistryStore>, reference: &str) -> Option<Agent> {
    if let Ok(id) = Uuid::parse_str(reference) {
        if let Some(agent) = store.get_agent(id).await {
            return Some(agent);
        }
    }
    store.agent_by_oba_id(reference).await
}

async fn first_active_agent_for(
    store: &Arc<dyn RegistryStore>,
    username: &str,
) -> Option<Agent> {
    let profile = store.profile_by_username(username).await?;
    store
        .agents_by_user(profile.user_id)
        .await
        .into_iter()
        .find(|a| a.status == AgentStatus::Active)
}
