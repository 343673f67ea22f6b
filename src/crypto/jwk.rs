//! Ed25519 JSON Web Keys (RFC 8037 OKP form) and key identifiers.
//!
//! Only `OKP`/`Ed25519` keys are supported. The canonical key identifier is
//! the RFC 7638 thumbprint: base64url (no padding) of the SHA-256 digest of
//! the canonical JWK JSON `{"crv":"Ed25519","kty":"OKP","x":"…"}` - members
//! in lexicographic order, no whitespace. Keys registered before the
//! thumbprint rule was adopted were identified by a base64url prefix of the
//! raw key bytes; [`legacy_kid`] reproduces that form so directories can
//! emit it as an alias while old signatures are still in circulation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced when interpreting a JWK.
#[derive(Debug, Error)]
pub enum JwkError {
    /// `kty` was not `OKP`.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// `crv` was not `Ed25519`.
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// The `x` member was not valid base64url.
    #[error("invalid base64url in 'x' member")]
    InvalidEncoding,

    /// The decoded public key was not exactly 32 bytes, or was not a valid
    /// curve point.
    #[error("invalid Ed25519 public key material")]
    InvalidKeyMaterial,
}

/// A single JSON Web Key in OKP Ed25519 form.
///
/// Optional members beyond the required triple are preserved so directory
/// documents can round-trip `x5c` chains and `kid` values untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    /// Key type - `"OKP"` for Ed25519 keys.
    pub kty: String,

    /// Curve - `"Ed25519"`.
    pub crv: String,

    /// Base64url-encoded public key bytes (32 bytes).
    pub x: String,

    /// Key identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Intended use; `"sig"` when present.
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Algorithm label; `"EdDSA"` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Certificate chain, leaf first, each entry base64 DER.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

impl Jwk {
    /// Build a JWK from raw 32-byte Ed25519 public key material.
    ///
    /// The canonical thumbprint is set as `kid`.
    #[must_use]
    pub fn from_public_key_bytes(bytes: &[u8; 32]) -> Self {
        let x = URL_SAFE_NO_PAD.encode(bytes);
        let kid = canonical_kid(&x);
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x,
            kid: Some(kid),
            key_use: Some("sig".to_string()),
            alg: Some("EdDSA".to_string()),
            x5c: None,
        }
    }

    /// Build a JWK from a base64url-encoded `x` member as stored in the
    /// registry, deriving the canonical thumbprint as `kid`.
    pub fn from_x(x: &str) -> Result<Self, JwkError> {
        let bytes = decode_x(x)?;
        Ok(Self::from_public_key_bytes(&bytes))
    }

    /// Decode this JWK into a verifier, validating type, curve, and point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, JwkError> {
        if !self.kty.eq_ignore_ascii_case("OKP") {
            return Err(JwkError::UnsupportedKeyType(self.kty.clone()));
        }
        if self.crv != "Ed25519" {
            return Err(JwkError::UnsupportedCurve(self.crv.clone()));
        }
        let bytes = decode_x(&self.x)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| JwkError::InvalidKeyMaterial)
    }

    /// The canonical thumbprint for this key, regardless of the `kid` member.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        canonical_kid(&self.x)
    }

    /// The legacy key identifier for this key, when the material decodes.
    #[must_use]
    pub fn legacy_id(&self) -> Option<String> {
        decode_x(&self.x).ok().map(|b| legacy_kid(&b))
    }
}

/// Canonical RFC 7638 thumbprint over the base64url `x` member.
#[must_use]
pub fn canonical_kid(x: &str) -> String {
    let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{x}"}}"#);
    let digest = Sha256::digest(canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Legacy key identifier: base64url of the first 8 bytes of the raw key.
#[must_use]
pub fn legacy_kid(public_key: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(&public_key[..8])
}

fn decode_x(x: &str) -> Result<[u8; 32], JwkError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(x.as_bytes())
        .map_err(|_| JwkError::InvalidEncoding)?;
    bytes.try_into().map_err(|_| JwkError::InvalidKeyMaterial)
}
