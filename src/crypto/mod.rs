//! Cryptographic primitives - Ed25519 JWK handling and key identifiers.

pub mod jwk;

pub use jwk::{Jwk, JwkError, canonical_kid, legacy_kid};
