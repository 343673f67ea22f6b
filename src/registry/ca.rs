//! Certificate authority - leaf issuance over agent keys.
//!
//! The CA signs X.509 leaf certificates whose subject public key is the
//! agent's **existing** Ed25519 key; the agent's private key never leaves
//! the client. Possession is proven with a one-shot signature over
//! `cert-issue:{agent_id}:{unix_seconds}`, replay-protected through the
//! store's atomic PoP-nonce primitive.
//!
//! Issuance is serialized per agent via the store's issuance lock so the
//! cap checks and the insert cannot interleave; any failure after the PoP
//! nonce was consumed rolls the nonce back.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ED25519, SanType, SerialNumber, SubjectPublicKeyInfo,
};
use rcgen::string::Ia5String;
use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::model::{Agent, AgentCertificate, is_valid_agent_id};
use super::store::{RegistryStore, StoreError};

/// PoP message prefix.
const POP_PREFIX: &str = "cert-issue:";
/// PoP timestamps may run this far ahead of the CA clock.
const POP_FUTURE_SKEW_SECS: i64 = 30;
/// PoP timestamps older than this are rejected.
const POP_MAX_AGE_SECS: i64 = 300;
/// PoP nonce retention.
const POP_NONCE_TTL: StdDuration = StdDuration::from_secs(300);

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Issuance failures.
#[derive(Debug, Error)]
pub enum CaError {
    /// No CA certificate/key configured.
    #[error("certificate authority not configured")]
    NotConfigured,

    /// The proof message or signature is malformed or does not verify.
    #[error("invalid proof of possession: {0}")]
    InvalidProof(&'static str),

    /// The proof timestamp is outside the acceptance window.
    #[error("proof of possession expired")]
    ProofExpired,

    /// The proof was already consumed.
    #[error("proof of possession replayed")]
    Replay,

    /// The atomic PoP primitive is unavailable. Fail-closed.
    #[error("proof-of-possession store unavailable")]
    PopUnavailable,

    /// Daily issuance cap reached for this agent.
    #[error("daily issuance cap exceeded")]
    DailyCapExceeded,

    /// Active-certificate cap reached for this (agent, kid).
    #[error("active certificate cap exceeded")]
    ActiveCapExceeded,

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// rcgen or key-material failure.
    #[error("certificate generation failed: {0}")]
    Generation(String),
}

/// Proof of possession presented at issuance.
#[derive(Debug, Clone, Deserialize)]
pub struct ProofOfPossession {
    /// `cert-issue:{agent_id}:{unix_seconds}`.
    pub message: String,
    /// Base64 Ed25519 signature over the message bytes.
    pub signature: String,
}

/// CA issuance policy.
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// Leaf validity in days.
    pub leaf_valid_days: i64,
    /// Max issuances per agent per day.
    pub max_issues_per_agent_per_day: usize,
    /// Max active certificates per (agent, kid).
    pub max_active_per_kid: usize,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            leaf_valid_days: 90,
            max_issues_per_agent_per_day: 10,
            max_active_per_kid: 1,
        }
    }
}

/// The issued leaf, as returned to the caller and persisted.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    /// Unique serial, hex.
    pub serial: String,
    /// Certified key id.
    pub kid: String,
    /// Leaf PEM.
    pub leaf_pem: String,
    /// Leaf + CA PEM.
    pub chain_pem: String,
    /// Base64 DER chain, leaf first.
    pub x5c: Vec<String>,
    /// Validity start.
    pub not_before: DateTime<Utc>,
    /// Validity end.
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the leaf DER, lowercase hex.
    pub fingerprint_sha256: String,
}

/// A loaded certificate authority.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: String,
    ca_der_b64: String,
    settings: CaSettings,
}

/// A generated CA certificate and key, PEM-encoded.
#[derive(Debug)]
pub struct GeneratedCa {
    /// CA certificate PEM.
    pub cert_pem: String,
    /// CA private key PEM.
    pub key_pem: String,
}

/// Generate a self-signed Ed25519 CA certificate.
pub fn generate_ca(common_name: &str, validity_days: i64) -> Result<GeneratedCa, CaError> {
    let key = KeyPair::generate_for(&PKCS_ED25519)
        .map_err(|e| CaError::Generation(format!("CA key generation: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after =
        time::OffsetDateTime::now_utc() + time::Duration::days(validity_days);

    let cert = params
        .self_signed(&key)
        .map_err(|e| CaError::Generation(format!("CA self-sign: {e}")))?;

    Ok(GeneratedCa {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

impl CertificateAuthority {
    /// Load a CA from PEM material, validating the certificate parses and
    /// is a CA.
    pub fn load(ca_cert_pem: &str, ca_key_pem: &str, settings: CaSettings) -> Result<Self, CaError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(ca_cert_pem.as_bytes())
            .map_err(|e| CaError::Generation(format!("CA PEM parse: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CaError::Generation(format!("CA cert parse: {e}")))?;
        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .is_some_and(|ext| ext.value.ca);
        if !is_ca {
            return Err(CaError::Generation(
                "configured certificate is not a CA".to_string(),
            ));
        }
        let subject = cert.subject().to_string();

        // Validate the key parses up front rather than at first issuance.
        KeyPair::from_pem(ca_key_pem)
            .map_err(|e| CaError::Generation(format!("CA key parse: {e}")))?;

        info!(subject = %subject, "Certificate authority loaded");
        Ok(Self {
            ca_cert_pem: ca_cert_pem.to_string(),
            ca_key_pem: ca_key_pem.to_string(),
            ca_der_b64: STANDARD.encode(&pem.contents),
            settings,
        })
    }

    /// The CA certificate PEM, served at `/.well-known/ca.pem`.
    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issuance policy.
    #[must_use]
    pub fn settings(&self) -> &CaSettings {
        &self.settings
    }

    /// Issue a leaf certificate for `agent`, gated by the proof of
    /// possession. `agent_ref` is the identifier the caller addressed the
    /// agent by; the proof message must name it.
    pub async fn issue(
        &self,
        store: &Arc<dyn RegistryStore>,
        agent: &Agent,
        agent_ref: &str,
        proof: &ProofOfPossession,
    ) -> Result<IssuedCertificate, CaError> {
        let now = Utc::now();
        validate_proof_message(&proof.message, agent_ref, now)?;
        verify_proof_signature(agent, proof)?;

        // One-shot: consume the proof before any other work. Unavailability
        // of the atomic primitive rejects, never allows.
        let digest = hex::encode(Sha256::digest(proof.message.as_bytes()));
        let fresh = store
            .pop_nonce_check_and_set(&digest, POP_NONCE_TTL)
            .await
            .map_err(|_| CaError::PopUnavailable)?;
        if !fresh {
            warn!(agent = %agent.id, "PoP replay rejected");
            return Err(CaError::Replay);
        }

        // Serialize caps-check + insert per agent.
        let lock = store.issuance_lock(agent.id);
        let _guard = lock.lock().await;

        let result = self.issue_locked(store, agent, now).await;
        if result.is_err() {
            // The proof was not spent on a certificate; let the caller
            // present it again.
            store.pop_nonce_remove(&digest).await;
        }
        result
    }

    async fn issue_locked(
        &self,
        store: &Arc<dyn RegistryStore>,
        agent: &Agent,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate, CaError> {
        let day_start = now - Duration::days(1);
        let issued_today = store.certificates_issued_since(agent.id, day_start).await;
        if issued_today >= self.settings.max_issues_per_agent_per_day {
            return Err(CaError::DailyCapExceeded);
        }

        let kid = agent.jwk.thumbprint();
        let active = store
            .active_certificates_for_kid(agent.id, &kid, now)
            .await;
        if active >= self.settings.max_active_per_kid {
            return Err(CaError::ActiveCapExceeded);
        }

        let issued = self.sign_leaf(agent, &kid, now)?;

        let record = AgentCertificate {
            serial: issued.serial.clone(),
            agent_id: agent.id,
            user_id: agent.user_id,
            kid: issued.kid.clone(),
            leaf_pem: issued.leaf_pem.clone(),
            chain_pem: issued.chain_pem.clone(),
            x5c: issued.x5c.clone(),
            not_before: issued.not_before,
            not_after: issued.not_after,
            fingerprint_sha256: issued.fingerprint_sha256.clone(),
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        };
        store.insert_certificate(record).await?;

        info!(
            agent = %agent.id,
            serial = %issued.serial,
            kid = %issued.kid,
            "Leaf certificate issued"
        );
        Ok(issued)
    }

    fn sign_leaf(
        &self,
        agent: &Agent,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate, CaError> {
        let verifying_key = agent
            .jwk
            .verifying_key()
            .map_err(|_| CaError::Generation("agent key is not a valid Ed25519 key".to_string()))?;

        let mut spki_der = Vec::with_capacity(44);
        spki_der.extend_from_slice(&ED25519_SPKI_PREFIX);
        spki_der.extend_from_slice(&verifying_key.to_bytes());
        let subject_key = SubjectPublicKeyInfo::from_der(&spki_der)
            .map_err(|e| CaError::Generation(format!("subject key: {e}")))?;

        let serial_bytes: [u8; 16] = rand::rng().random();
        let serial = hex::encode(serial_bytes);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sanitize_common_name(&agent.name));
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        params.not_before = to_offset(now);
        let not_after = now + Duration::days(self.settings.leaf_valid_days);
        params.not_after = to_offset(not_after);

        if let Some(ref oba_id) = agent.oba_agent_id {
            if is_valid_agent_id(oba_id) {
                let ia5 = Ia5String::try_from(oba_id.as_str())
                    .map_err(|e| CaError::Generation(format!("agent id SAN: {e}")))?;
                params.subject_alt_names = vec![SanType::URI(ia5)];
            }
        }

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| CaError::Generation(format!("CA key parse: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| CaError::Generation(format!("issuer: {e}")))?;

        let cert = params
            .signed_by(&subject_key, &issuer)
            .map_err(|e| CaError::Generation(format!("leaf signing: {e}")))?;

        let leaf_der = cert.der().to_vec();
        let fingerprint = hex::encode(Sha256::digest(&leaf_der));
        let leaf_pem = cert.pem();
        let chain_pem = format!("{leaf_pem}{}", self.ca_cert_pem);

        Ok(IssuedCertificate {
            serial,
            kid: kid.to_string(),
            leaf_pem,
            chain_pem,
            x5c: vec![STANDARD.encode(&leaf_der), self.ca_der_b64.clone()],
            not_before: now,
            not_after,
            fingerprint_sha256: fingerprint,
        })
    }
}

/// Validate the proof message shape, agent binding, and time window.
fn validate_proof_message(
    message: &str,
    agent_ref: &str,
    now: DateTime<Utc>,
) -> Result<(), CaError> {
    let rest = message
        .strip_prefix(POP_PREFIX)
        .ok_or(CaError::InvalidProof("message prefix"))?;
    let (named_agent, ts) = rest
        .rsplit_once(':')
        .ok_or(CaError::InvalidProof("message shape"))?;
    if named_agent != agent_ref {
        return Err(CaError::InvalidProof("agent mismatch"));
    }
    let ts: i64 = ts
        .parse()
        .map_err(|_| CaError::InvalidProof("timestamp"))?;

    let now_secs = now.timestamp();
    if ts > now_secs + POP_FUTURE_SKEW_SECS || ts < now_secs - POP_MAX_AGE_SECS {
        return Err(CaError::ProofExpired);
    }
    Ok(())
}

/// Verify the Ed25519 proof signature against the agent's stored key.
fn verify_proof_signature(agent: &Agent, proof: &ProofOfPossession) -> Result<(), CaError> {
    let sig_bytes = STANDARD
        .decode(proof.signature.as_bytes())
        .map_err(|_| CaError::InvalidProof("signature encoding"))?;
    if sig_bytes.len() != 64 {
        return Err(CaError::InvalidProof("signature length"));
    }
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| CaError::InvalidProof("signature bytes"))?;
    let key = agent
        .jwk
        .verifying_key()
        .map_err(|_| CaError::InvalidProof("agent key"))?;
    key.verify(proof.message.as_bytes(), &signature)
        .map_err(|_| CaError::InvalidProof("signature verification"))
}

/// Subject CN sanitization: control and DN-special characters become
/// spaces, whitespace collapses, 64-char clip, fixed fallback.
#[must_use]
pub fn sanitize_common_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' | '\0' => ' ',
            '=' | ',' | '+' | '<' | '>' | '#' | ';' | '"' | '\\' => ' ',
            other => other,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let clipped: String = collapsed.chars().take(64).collect();
    let trimmed = clipped.trim().to_string();
    if trimmed.is_empty() {
        "OpenBotAuth Agent".to_string()
    } else {
        trimmed
    }
}

fn to_offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
}

/// Convenience for building the PoP message client-side and in tests.
#[must_use]
pub fn pop_message(agent_ref: &str, unix_seconds: i64) -> String {
    format!("{POP_PREFIX}{agent_ref}:{unix_seconds}")
}

/// Parse-side companion of [`pop_message`], exposed for diagnostics.
#[must_use]
pub fn pop_digest(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}
