//! Certificate HTTP surface over the [`CertificateAuthority`].
//!
//! Issuance and revocation require `agents:write`; listing and
//! authenticated status require `agents:read`. The public status route is
//! addressable by fingerprint only - serial lookups stay authenticated so
//! serials cannot be enumerated.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::RegistryState;
use super::agents::owned_agent;
use super::auth::AuthPrincipal;
use super::ca::{CaError, CertificateAuthority, ProofOfPossession};
use super::error::RegistryError;
use super::model::{AgentCertificate, RevocationReason, is_valid_fingerprint};
use super::store::CertSelector;

/// Body of `POST /v1/certs/issue`.
#[derive(Debug, Deserialize)]
pub struct IssueBody {
    /// Agent reference: internal id or `oba_agent_id`.
    pub agent_id: String,
    /// Proof of possession of the agent key.
    pub proof: ProofOfPossession,
}

/// Body of `POST /v1/certs/revoke`.
#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    /// Address by serial.
    pub serial: Option<String>,
    /// Address by kid - revokes every matching certificate.
    pub kid: Option<String>,
    /// Address by leaf fingerprint.
    pub fingerprint_sha256: Option<String>,
    /// RFC 5280 reason; defaults to `unspecified`.
    pub reason: Option<String>,
}

/// Query of the status routes.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Serial lookup (authenticated route only).
    pub serial: Option<String>,
    /// Fingerprint lookup.
    pub fingerprint_sha256: Option<String>,
}

/// Status response shape.
#[derive(Debug, Serialize)]
pub struct CertStatus {
    /// Inside validity window and unrevoked.
    pub valid: bool,
    /// Revoked flag.
    pub revoked: bool,
    /// Revocation reason when revoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<RevocationReason>,
    /// Validity start.
    pub not_before: chrono::DateTime<chrono::Utc>,
    /// Validity end.
    pub not_after: chrono::DateTime<chrono::Utc>,
    /// Leaf fingerprint.
    pub fingerprint_sha256: String,
}

impl CertStatus {
    fn from_cert(cert: &AgentCertificate) -> Self {
        let now = Utc::now();
        Self {
            valid: cert.is_active(now),
            revoked: cert.revoked_at.is_some(),
            revoked_reason: cert.revoked_reason,
            not_before: cert.not_before,
            not_after: cert.not_after,
            fingerprint_sha256: cert.fingerprint_sha256.clone(),
        }
    }
}

fn require_ca(state: &RegistryState) -> Result<&CertificateAuthority, RegistryError> {
    state.ca.as_ref().ok_or(RegistryError::NotImplemented)
}

fn map_ca_error(e: CaError) -> RegistryError {
    match e {
        CaError::NotConfigured => RegistryError::NotImplemented,
        CaError::InvalidProof(_) => RegistryError::Forbidden("invalid proof"),
        CaError::ProofExpired => RegistryError::Forbidden("proof expired"),
        CaError::Replay => RegistryError::Forbidden("replay"),
        CaError::PopUnavailable => RegistryError::Unavailable,
        CaError::DailyCapExceeded => RegistryError::TooManyRequests,
        CaError::ActiveCapExceeded => {
            RegistryError::Conflict("active certificate cap exceeded".to_string())
        }
        CaError::Store(e) => e.into(),
        CaError::Generation(_) => RegistryError::Internal,
    }
}

/// POST /v1/certs/issue
pub async fn issue_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<IssueBody>,
) -> Result<Response, RegistryError> {
    let ca = require_ca(&state)?;
    let agent = owned_agent(&state, &principal, &body.agent_id).await?;

    let issued = ca
        .issue(&state.store, &agent, &body.agent_id, &body.proof)
        .await
        .map_err(map_ca_error)?;

    Ok(Json(issued).into_response())
}

/// POST /v1/certs/revoke
pub async fn revoke_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(body): Json<RevokeBody>,
) -> Result<Response, RegistryError> {
    require_ca(&state)?;

    let reason = match body.reason.as_deref() {
        None => RevocationReason::Unspecified,
        Some(raw) => raw
            .parse()
            .map_err(|()| RegistryError::BadRequest(format!("unknown reason: {raw}")))?,
    };

    // Resolve to caller-owned certificates before touching anything.
    let targets: Vec<AgentCertificate> = if let Some(serial) = body.serial {
        state
            .store
            .certificate_by_serial(&serial)
            .await
            .into_iter()
            .collect()
    } else if let Some(kid) = body.kid {
        state
            .store
            .certificates_by_user(principal.user.id)
            .await
            .into_iter()
            .filter(|c| c.kid == kid)
            .collect()
    } else if let Some(fingerprint) = body.fingerprint_sha256 {
        if !is_valid_fingerprint(&fingerprint) {
            return Err(RegistryError::BadRequest(
                "fingerprint must be 64 lowercase hex characters".to_string(),
            ));
        }
        state
            .store
            .certificate_by_fingerprint(&fingerprint)
            .await
            .into_iter()
            .collect()
    } else {
        return Err(RegistryError::BadRequest(
            "serial, kid, or fingerprint_sha256 required".to_string(),
        ));
    };

    if targets.is_empty() || targets.iter().any(|c| c.user_id != principal.user.id) {
        // Other users' certificates are not acknowledged.
        return Err(RegistryError::NotFound);
    }

    let now = Utc::now();
    let mut revoked = 0usize;
    let mut matched = 0usize;
    for cert in &targets {
        let outcome = state
            .store
            .revoke_certificates(&CertSelector::Serial(cert.serial.clone()), reason, now)
            .await?;
        matched += 1;
        revoked += outcome.revoked;
    }
    let already_revoked = revoked == 0 && matched > 0;
    info!(
        user = %principal.user.id,
        revoked,
        already_revoked,
        "Certificate revocation"
    );

    Ok(Json(json!({
        "revoked": revoked,
        "already_revoked": already_revoked,
    }))
    .into_response())
}

/// GET /v1/certs - the caller's certificates.
pub async fn list_certs_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Json<Vec<AgentCertificate>> {
    Json(state.store.certificates_by_user(principal.user.id).await)
}

/// GET /v1/certs/{serial}
pub async fn get_cert_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(serial): Path<String>,
) -> Result<Json<AgentCertificate>, RegistryError> {
    let cert = state
        .store
        .certificate_by_serial(&serial)
        .await
        .ok_or(RegistryError::NotFound)?;
    if cert.user_id != principal.user.id {
        return Err(RegistryError::NotFound);
    }
    Ok(Json(cert))
}

/// GET /v1/certs/status - authenticated; serial or fingerprint.
pub async fn status_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<CertStatus>, RegistryError> {
    let cert = if let Some(ref serial) = query.serial {
        state.store.certificate_by_serial(serial).await
    } else if let Some(ref fingerprint) = query.fingerprint_sha256 {
        state.store.certificate_by_fingerprint(fingerprint).await
    } else {
        return Err(RegistryError::BadRequest(
            "serial or fingerprint_sha256 required".to_string(),
        ));
    }
    .ok_or(RegistryError::NotFound)?;

    if cert.user_id != principal.user.id {
        return Err(RegistryError::NotFound);
    }
    Ok(Json(CertStatus::from_cert(&cert)))
}

/// GET /v1/certs/public-status - fingerprint only, never serial, so
/// serials cannot be probed anonymously.
pub async fn public_status_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<CertStatus>, RegistryError> {
    let Some(fingerprint) = query.fingerprint_sha256 else {
        return Err(RegistryError::BadRequest(
            "fingerprint_sha256 required".to_string(),
        ));
    };
    if !is_valid_fingerprint(&fingerprint) {
        return Err(RegistryError::BadRequest(
            "fingerprint must be 64 lowercase hex characters".to_string(),
        ));
    }

    let cert = state
        .store
        .certificate_by_fingerprint(&fingerprint)
        .await
        .ok_or(RegistryError::NotFound)?;
    Ok(Json(CertStatus::from_cert(&cert)))
}

