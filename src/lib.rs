//! OpenBotAuth - cryptographic identity for non-human HTTP clients.
//!
//! Three subsystems:
//!
//! - **Verifier** ([`verifier`]): RFC 9421 HTTP Message Signature
//!   verification at the origin edge - freshness, replay defense, directory
//!   trust, Ed25519.
//! - **Registry** ([`registry`]): accounts, profiles, Ed25519 keys with
//!   history, agents, personal access tokens, sessions, an X.509 leaf CA,
//!   and JWKS directory endpoints.
//! - **Signer** ([`signer`]): the bot-side counterpart - signature
//!   construction and the 402 payment negotiation loop.
//!
//! [`msgsig`] holds the shared wire format, [`crypto`] the JWK handling,
//! and [`policy`] the verdict type and pay-gate interface consumed by
//! content hosts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod msgsig;
pub mod policy;
pub mod registry;
pub mod signer;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
