//! Verifier error taxonomy.
//!
//! Every failure maps to a stable machine-readable code and an HTTP status.
//! The codes are part of the wire contract: edge integrations branch on
//! them, so they never change spelling.

use axum::http::StatusCode;
use thiserror::Error;

/// The exhaustive set of verification failures.
///
/// All verification failures are 401 except [`VerifyError::RateLimited`];
/// upstream directory problems deliberately collapse into
/// [`VerifyError::DirectoryFetch`] so remote status codes never leak to the
/// caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// One of the three required signature headers is absent.
    #[error("missing signature headers")]
    MissingSignature,

    /// `Signature-Input` or `Signature` could not be parsed.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// `created` is further in the past than the allowed skew.
    #[error("signature created too far in the past")]
    Stale,

    /// `created` is further in the future than the allowed skew.
    #[error("signature created in the future")]
    Future,

    /// The signature passed its expiry.
    #[error("signature expired")]
    Expired,

    /// The signature parameters carry no nonce.
    #[error("signature nonce missing")]
    NonceMissing,

    /// The nonce was already seen inside its TTL window.
    #[error("signature nonce replayed")]
    Replay,

    /// The keyid is not present in the directory, even after refresh.
    #[error("key id not found in directory")]
    UnknownKeyId,

    /// Ed25519 verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// A credential-bearing header was listed in the covered components.
    #[error("sensitive header covered: {0}")]
    SensitiveHeaderCovered(String),

    /// The `Signature-Agent` host is not on the directory allow-list.
    #[error("untrusted directory: {0}")]
    UntrustedDirectory(String),

    /// The directory could not be fetched (network, timeout, upstream
    /// error, or backoff window).
    #[error("directory fetch failed")]
    DirectoryFetch,

    /// A required `tag` parameter is absent or mismatched.
    #[error("required signature tag missing or mismatched")]
    TagRequired,

    /// Per-IP or per-agent burst exceeded.
    #[error("rate limited")]
    RateLimited,
}

impl VerifyError {
    /// The stable machine-readable code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSignature => "MissingSignature",
            Self::MalformedSignature(_) => "MalformedSignature",
            Self::Stale => "Stale",
            Self::Future => "Future",
            Self::Expired => "Expired",
            Self::NonceMissing => "NonceMissing",
            Self::Replay => "Replay",
            Self::UnknownKeyId => "UnknownKeyId",
            Self::BadSignature => "BadSignature",
            Self::SensitiveHeaderCovered(_) => "SensitiveHeaderCovered",
            Self::UntrustedDirectory(_) => "UntrustedDirectory",
            Self::DirectoryFetch => "DirectoryFetch",
            Self::TagRequired => "TagRequired",
            Self::RateLimited => "RateLimited",
        }
    }

    /// The HTTP status this failure maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}
