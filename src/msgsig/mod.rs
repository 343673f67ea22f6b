//! RFC 9421 HTTP Message Signatures - wire format and signature base.
//!
//! # Module layout
//! - [`params`]: the `Signature-Input` parameter grammar - inner list of
//!   covered components plus the `created`/`expires`/`nonce`/`keyid`/`alg`/
//!   `tag` parameters, and the value sum type used while parsing.
//! - [`base`]: the canonical signature base - the byte string that is
//!   actually signed and verified.
//! - [`headers`]: extraction of the three signature headers from a request
//!   and selection of a single signature label.
//!
//! # Wire format
//! A signed request carries three headers:
//!
//! ```text
//! Signature-Input: sig1=("@method" "@path" "@authority");created=<int>;expires=<int>;nonce="<b64url>";keyid="<id>";alg="ed25519"
//! Signature: sig1=:<base64 signature>:
//! Signature-Agent: <absolute URL of the signer's key directory>
//! ```
//!
//! The signature base is rebuilt on the verifying side from the request and
//! the *exact* parameter text observed in `Signature-Input` - re-serializing
//! parsed parameters would break verification whenever the sender's
//! serialization differs byte-for-byte from ours.

pub mod base;
pub mod headers;
pub mod params;

pub use base::{BaseError, RequestComponents, build_signature_base};
pub use headers::{HeaderError, SignatureEnvelope, extract_envelope};
pub use params::{CoveredComponent, ParamValue, SignatureParams};

/// Headers that must never be covered by a signature. Covering them would
/// make the origin replay credentials into the signature base.
pub const SENSITIVE_HEADERS: [&str; 4] = [
    "cookie",
    "authorization",
    "proxy-authorization",
    "www-authenticate",
];
