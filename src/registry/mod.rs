//! Identity Registry service.
//!
//! Accounts, profiles, keys and key history, agents, personal access
//! tokens, sessions, the certificate authority, JWKS directory endpoints,
//! and telemetry.

pub mod agents;
pub mod auth;
pub mod ca;
pub mod certs;
pub mod error;
pub mod jwks;
pub mod keys;
pub mod model;
pub mod oauth;
pub mod profiles;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod tokens;

use std::sync::Arc;

pub use error::RegistryError;
pub use store::{InMemoryStore, RegistryStore};
pub use telemetry::{RegistryVerificationSink, StatsStore};

/// Service-level settings threaded through the handlers.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// External base URL, used for OAuth callbacks and discovery documents.
    pub public_base_url: String,
    /// Maximum personal access tokens per user.
    pub max_tokens_per_user: usize,
    /// Where the browser lands after a plain login.
    pub post_login_redirect: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            max_tokens_per_user: 10,
            post_login_redirect: "/".to_string(),
        }
    }
}

/// Shared state of the registry router.
pub struct RegistryState {
    /// The persistence layer.
    pub store: Arc<dyn RegistryStore>,
    /// Telemetry counters.
    pub stats: Arc<StatsStore>,
    /// Authentication middleware state.
    pub auth: Arc<auth::AuthState>,
    /// Per-user limiter for token list/delete calls.
    pub token_ops: tokens::TokenOpsLimiter,
    /// GitHub OAuth client, when configured.
    pub oauth: Option<oauth::GithubOauth>,
    /// Certificate authority, when configured.
    pub ca: Option<ca::CertificateAuthority>,
    /// Service settings.
    pub settings: RegistrySettings,
}
