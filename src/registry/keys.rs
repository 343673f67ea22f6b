//! User key registration and history.
//!
//! Keys are uploaded as public material only - the registry never sees a
//! private key. Registration appends to the history and deactivates the
//! previous key; the directory endpoint picks up the rotation immediately.

use std::sync::Arc;

use axum::{Extension, Json, extract::State, response::Response};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::RegistryState;
use super::auth::AuthPrincipal;
use super::error::RegistryError;
use super::model::KeyRecord;
use crate::crypto::Jwk;

/// Body of `POST /keys`. Either the raw base64url `x` member or a full
/// OKP JWK.
#[derive(Debug, Deserialize)]
pub struct RegisterKeyBody {
    /// Base64url-encoded 32-byte Ed25519 public key.
    pub public_key: Option<String>,
    /// Full JWK alternative.
    pub jwk: Option<Jwk>,
}

/// Response entry for key routes.
#[derive(Debug, Serialize)]
pub struct KeyInfo {
    /// Row id.
    pub id: uuid::Uuid,
    /// Canonical thumbprint kid.
    pub kid: String,
    /// Legacy alias kid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_kid: Option<String>,
    /// Whether this is the current key.
    pub active: bool,
    /// Registration time.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl KeyInfo {
    fn from_record(record: &KeyRecord) -> Result<Self, RegistryError> {
        let jwk = Jwk::from_x(&record.x)
            .map_err(|_| RegistryError::Internal)?;
        Ok(Self {
            id: record.id,
            kid: jwk.thumbprint(),
            legacy_kid: jwk.legacy_id(),
            active: record.active,
            created_at: record.created_at,
        })
    }
}

/// POST /keys - register a new active key (rotation).
pub async fn register_key_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<RegisterKeyBody>,
) -> Result<Json<KeyInfo>, RegistryError> {
    let x = match (body.public_key, body.jwk) {
        (Some(x), _) => x,
        (None, Some(jwk)) => jwk.x,
        (None, None) => {
            return Err(RegistryError::BadRequest(
                "public_key or jwk required".to_string(),
            ));
        }
    };

    // Reject anything that is not a usable Ed25519 point before storing.
    let jwk = Jwk::from_x(&x)
        .map_err(|e| RegistryError::BadRequest(format!("invalid public key: {e}")))?;
    jwk.verifying_key()
        .map_err(|e| RegistryError::BadRequest(format!("invalid public key: {e}")))?;

    let record = state.store.register_key(principal.user.id, &x).await?;
    info!(user = %principal.user.id, kid = %jwk.thumbprint(), "Key registered");

    Ok(Json(KeyInfo::from_record(&record)?))
}

/// GET /keys - the current active key.
pub async fn active_key_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Response, RegistryError> {
    let record = state
        .store
        .active_key(principal.user.id)
        .await
        .ok_or(RegistryError::NotFound)?;
    Ok(Json(KeyInfo::from_record(&record)?).into_response())
}

/// GET /keys/history - full append-only history, oldest first.
pub async fn key_history_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Json<Vec<KeyInfo>>, RegistryError> {
    let history = state.store.key_history(principal.user.id).await;
    let mut out = Vec::with_capacity(history.len());
    for record in &history {
        out.push(KeyInfo::from_record(record)?);
    }
    Ok(Json(out))
}
