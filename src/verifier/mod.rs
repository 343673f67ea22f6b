//! Signature Verifier service.
//!
//! Verifies RFC 9421 HTTP Message Signatures at the origin edge: parses the
//! signature headers, enforces freshness and replay, resolves the signer's
//! key through its `Signature-Agent` directory, and returns a verdict plus
//! agent identity.

pub mod engine;
pub mod error;
pub mod jwks_cache;
pub mod nonce;
pub mod router;

pub use engine::{
    AgentIdentity, SignedRequest, VerificationEvent, VerificationSink, VerifierEngine,
    VerifierPolicy, Verification,
};
pub use error::VerifyError;
pub use jwks_cache::{
    Directory, DirectoryFetcher, FetchFailure, FetchOutcome, HttpDirectoryFetcher, JwksCache,
    JwksCacheConfig,
};
pub use nonce::NonceCache;
