//! Agent CRUD.
//!
//! Agents are named sub-identities with their own JWK. The structured
//! `oba_agent_id` (`agent:LOCAL@HOST[/RESOURCE]`) is validated on write and
//! unique across the registry.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::RegistryState;
use super::auth::AuthPrincipal;
use super::error::RegistryError;
use super::model::{Agent, AgentStatus, is_valid_agent_id};
use crate::crypto::Jwk;

/// Body of `POST /agents`.
#[derive(Debug, Deserialize)]
pub struct CreateAgentBody {
    /// Display name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Type tag.
    pub agent_type: Option<String>,
    /// Public key as a full JWK.
    pub jwk: Option<Jwk>,
    /// Public key as a bare base64url `x` member.
    pub public_key: Option<String>,
    /// Structured agent identifier.
    pub oba_agent_id: Option<String>,
    /// Delegating parent.
    pub oba_parent_agent_id: Option<String>,
    /// Acting principal.
    pub oba_principal: Option<String>,
    /// Initial status; defaults to `active`.
    pub status: Option<AgentStatus>,
}

/// Body of `PUT /agents/{id}`. Absent fields are kept.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateAgentBody {
    /// Display name.
    pub name: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Type tag.
    pub agent_type: Option<String>,
    /// Replacement key.
    pub jwk: Option<Jwk>,
    /// Lifecycle state.
    pub status: Option<AgentStatus>,
    /// Structured agent identifier.
    pub oba_agent_id: Option<String>,
    /// Delegating parent.
    pub oba_parent_agent_id: Option<String>,
    /// Acting principal.
    pub oba_principal: Option<String>,
}

/// GET /agents - the caller's agents.
pub async fn list_agents_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Json<Vec<Agent>> {
    Json(state.store.agents_by_user(principal.user.id).await)
}

/// POST /agents
pub async fn create_agent_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Agent>), RegistryError> {
    if body.name.trim().is_empty() {
        return Err(RegistryError::BadRequest("name required".to_string()));
    }

    let jwk = resolve_jwk(body.jwk, body.public_key)?;
    validate_agent_links(
        body.oba_agent_id.as_deref(),
        body.oba_parent_agent_id.as_deref(),
    )?;

    let now = Utc::now();
    let agent = Agent {
        id: Uuid::new_v4(),
        user_id: principal.user.id,
        name: body.name,
        description: body.description,
        agent_type: body.agent_type,
        status: body.status.unwrap_or(AgentStatus::Active),
        jwk,
        oba_agent_id: body.oba_agent_id,
        oba_parent_agent_id: body.oba_parent_agent_id,
        oba_principal: body.oba_principal,
        created_at: now,
        updated_at: now,
    };

    state.store.create_agent(agent.clone()).await?;
    info!(user = %principal.user.id, agent = %agent.id, "Agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /agents/{id}
pub async fn get_agent_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, RegistryError> {
    Ok(Json(owned_agent(&state, &principal, &id).await?))
}

/// PUT /agents/{id}
pub async fn update_agent_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAgentBody>,
) -> Result<Json<Agent>, RegistryError> {
    let mut agent = owned_agent(&state, &principal, &id).await?;

    if let Some(name) = body.name {
        if name.trim().is_empty() {
            return Err(RegistryError::BadRequest("name required".to_string()));
        }
        agent.name = name;
    }
    if let Some(description) = body.description {
        agent.description = Some(description);
    }
    if let Some(agent_type) = body.agent_type {
        agent.agent_type = Some(agent_type);
    }
    if let Some(jwk) = body.jwk {
        jwk.verifying_key()
            .map_err(|e| RegistryError::BadRequest(format!("invalid jwk: {e}")))?;
        agent.jwk = jwk;
    }
    if let Some(status) = body.status {
        agent.status = status;
    }
    if body.oba_agent_id.is_some() || body.oba_parent_agent_id.is_some() {
        validate_agent_links(
            body.oba_agent_id.as_deref(),
            body.oba_parent_agent_id.as_deref(),
        )?;
    }
    if let Some(oba_agent_id) = body.oba_agent_id {
        agent.oba_agent_id = Some(oba_agent_id);
    }
    if let Some(parent) = body.oba_parent_agent_id {
        agent.oba_parent_agent_id = Some(parent);
    }
    if let Some(oba_principal) = body.oba_principal {
        agent.oba_principal = Some(oba_principal);
    }
    agent.updated_at = Utc::now();

    state.store.update_agent(agent.clone()).await?;
    Ok(Json(agent))
}

/// DELETE /agents/{id} - cascades to the agent's certificates.
pub async fn delete_agent_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    let agent = owned_agent(&state, &principal, &id).await?;
    state.store.delete_agent(agent.id).await?;
    info!(user = %principal.user.id, agent = %agent.id, "Agent deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Resolve an agent by internal id or `oba_agent_id` and enforce ownership.
pub async fn owned_agent(
    state: &RegistryState,
    principal: &AuthPrincipal,
    reference: &str,
) -> Result<Agent, RegistryError> {
    let agent = if let Ok(uuid) = Uuid::parse_str(reference) {
        state.store.get_agent(uuid).await
    } else {
        state.store.agent_by_oba_id(reference).await
    }
    .ok_or(RegistryError::NotFound)?;

    if agent.user_id != principal.user.id {
        // Hide other users' agents rather than acknowledging them.
        return Err(RegistryError::NotFound);
    }
    Ok(agent)
}

fn resolve_jwk(jwk: Option<Jwk>, public_key: Option<String>) -> Result<Jwk, RegistryError> {
    let jwk = match (jwk, public_key) {
        (Some(jwk), _) => jwk,
        (None, Some(x)) => Jwk::from_x(&x)
            .map_err(|e| RegistryError::BadRequest(format!("invalid public key: {e}")))?,
        (None, None) => {
            return Err(RegistryError::BadRequest(
                "jwk or public_key required".to_string(),
            ));
        }
    };
    jwk.verifying_key()
        .map_err(|e| RegistryError::BadRequest(format!("invalid jwk: {e}")))?;
    Ok(jwk)
}

fn validate_agent_links(
    oba_agent_id: Option<&str>,
    oba_parent_agent_id: Option<&str>,
) -> Result<(), RegistryError> {
    for candidate in [oba_agent_id, oba_parent_agent_id].into_iter().flatten() {
        if !is_valid_agent_id(candidate) {
            return Err(RegistryError::BadRequest(format!(
                "invalid agent id: {candidate}"
            )));
        }
    }
    Ok(())
}
