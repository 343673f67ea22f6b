//! Profile endpoints.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use super::RegistryState;
use super::auth::AuthPrincipal;
use super::error::RegistryError;
use super::model::{Profile, is_valid_username};

/// Body of `PUT /profiles`. Absent fields keep their current values;
/// explicit `null` is treated as absent.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileBody {
    /// New username; must be unique (case-insensitive).
    pub username: Option<String>,
    /// Display name.
    pub client_name: Option<String>,
    /// Homepage.
    pub client_uri: Option<String>,
    /// Logo.
    pub logo_uri: Option<String>,
    /// Contacts.
    pub contacts: Option<Vec<String>>,
    /// Expected User-Agent.
    pub expected_user_agent: Option<String>,
    /// RFC 9309 product token.
    pub rfc9309_product_token: Option<String>,
    /// RFC 9309 compliance flags.
    pub rfc9309_compliance: Option<Vec<String>>,
    /// Crawl trigger.
    pub trigger: Option<String>,
    /// Crawl purpose.
    pub purpose: Option<String>,
    /// Targeted content.
    pub targeted_content: Option<String>,
    /// Rate control.
    pub rate_control: Option<String>,
    /// Rate expectation.
    pub rate_expectation: Option<String>,
    /// Known URLs.
    pub known_urls: Option<Vec<String>>,
    /// Telemetry visibility.
    pub is_public: Option<bool>,
}

/// GET /profiles - all public profiles.
pub async fn list_profiles_handler(
    State(state): State<Arc<RegistryState>>,
) -> Json<Vec<Profile>> {
    let mut profiles = state.store.list_public_profiles().await;
    profiles.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));
    Json(profiles)
}

/// GET /profiles/{username}
pub async fn get_profile_handler(
    State(state): State<Arc<RegistryState>>,
    Path(username): Path<String>,
) -> Result<Json<Profile>, RegistryError> {
    state
        .store
        .profile_by_username(&username)
        .await
        .map(Json)
        .ok_or(RegistryError::NotFound)
}

/// PUT /profiles - owner-only update.
pub async fn update_profile_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<UpdateProfileBody>,
) -> Result<Json<Profile>, RegistryError> {
    let mut profile = state
        .store
        .profile_by_user(principal.user.id)
        .await
        .ok_or(RegistryError::NotFound)?;

    if let Some(username) = body.username {
        if !is_valid_username(&username) {
            return Err(RegistryError::BadRequest("invalid username".to_string()));
        }
        profile.username = username;
    }
    if let Some(v) = body.client_name {
        profile.client_name = Some(v);
    }
    if let Some(v) = body.client_uri {
        profile.client_uri = Some(v);
    }
    if let Some(v) = body.logo_uri {
        profile.logo_uri = Some(v);
    }
    if let Some(v) = body.contacts {
        profile.contacts = v;
    }
    if let Some(v) = body.expected_user_agent {
        profile.expected_user_agent = Some(v);
    }
    if let Some(v) = body.rfc9309_product_token {
        profile.rfc9309_product_token = Some(v);
    }
    if let Some(v) = body.rfc9309_compliance {
        profile.rfc9309_compliance = v;
    }
    if let Some(v) = body.trigger {
        profile.trigger = Some(v);
    }
    if let Some(v) = body.purpose {
        profile.purpose = Some(v);
    }
    if let Some(v) = body.targeted_content {
        profile.targeted_content = Some(v);
    }
    if let Some(v) = body.rate_control {
        profile.rate_control = Some(v);
    }
    if let Some(v) = body.rate_expectation {
        profile.rate_expectation = Some(v);
    }
    if let Some(v) = body.known_urls {
        profile.known_urls = v;
    }
    if let Some(v) = body.is_public {
        profile.is_public = v;
    }
    profile.updated_at = Utc::now();

    state.store.upsert_profile(profile.clone()).await?;
    info!(user = %principal.user.id, username = %profile.username, "Profile updated");
    Ok(Json(profile))
}
