//! Configuration management.
//!
//! Settings come from three layers, later winning: struct defaults, an
//! optional YAML file, and environment variables. `OBA_`-prefixed
//! variables address nested fields (`OBA_VERIFIER__PORT=8081`); the short
//! deployment-contract names (`MAX_SKEW_SEC`, `TRUSTED_DIRECTORIES`, …)
//! are also honored directly.

use std::env;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::registry::ca::CaSettings;
use crate::verifier::{JwksCacheConfig, VerifierPolicy};
use crate::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Verifier service.
    pub verifier: VerifierConfig,
    /// Registry service.
    pub registry: RegistryConfig,
    /// Certificate authority.
    pub ca: CaConfig,
    /// Session cookies.
    pub session: SessionConfig,
}

/// Verifier service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Max allowed |now − created| in seconds.
    pub max_skew_sec: i64,
    /// Signature lifetime when `expires` is absent.
    pub default_expiry_sec: i64,
    /// Nonce cache TTL floor in seconds.
    pub nonce_ttl_sec: u64,
    /// Allow-listed directory hosts. Empty trusts nothing.
    pub trusted_directories: Vec<String>,
    /// Required `tag` parameter; empty disables the check.
    pub require_tag: Option<String>,
    /// Preferred label when requests carry several signatures.
    pub preferred_label: Option<String>,
    /// Cached-directory age before an unknown kid forces a refresh.
    pub kid_refresh_grace_sec: u64,
    /// Directory cache TTL when upstream sends no `max-age`.
    pub jwks_default_ttl_sec: u64,
    /// Upper clamp on upstream-provided directory TTLs.
    pub jwks_max_ttl_sec: u64,
    /// Stale-while-revalidate grace for the directory cache.
    pub jwks_swr_sec: u64,
    /// Directory fetch timeout.
    pub jwks_fetch_timeout_sec: u64,
    /// Bearer token for the cache-purge admin routes.
    pub admin_token: Option<String>,
    /// Per-IP requests per second.
    pub rate_limit_rps: u32,
    /// Per-IP burst.
    pub rate_limit_burst: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_skew_sec: 300,
            default_expiry_sec: 300,
            nonce_ttl_sec: 600,
            trusted_directories: Vec::new(),
            require_tag: None,
            preferred_label: None,
            kid_refresh_grace_sec: 30,
            jwks_default_ttl_sec: 300,
            jwks_max_ttl_sec: 3600,
            jwks_swr_sec: 60,
            jwks_fetch_timeout_sec: 5,
            admin_token: None,
            rate_limit_rps: 50,
            rate_limit_burst: 100,
        }
    }
}

impl VerifierConfig {
    /// The engine policy derived from this configuration.
    #[must_use]
    pub fn policy(&self) -> VerifierPolicy {
        VerifierPolicy {
            max_skew_secs: self.max_skew_sec,
            default_expiry_secs: self.default_expiry_sec,
            min_nonce_ttl: Duration::from_secs(self.nonce_ttl_sec),
            trusted_directories: self.trusted_directories.clone(),
            require_tag: self.require_tag.clone().filter(|t| !t.trim().is_empty()),
            preferred_label: self.preferred_label.clone(),
            kid_refresh_grace: Duration::from_secs(self.kid_refresh_grace_sec),
        }
    }

    /// The directory-cache configuration derived from this configuration.
    #[must_use]
    pub fn jwks_cache(&self) -> JwksCacheConfig {
        JwksCacheConfig {
            default_ttl: Duration::from_secs(self.jwks_default_ttl_sec),
            max_ttl: Duration::from_secs(self.jwks_max_ttl_sec),
            stale_while_revalidate: Duration::from_secs(self.jwks_swr_sec),
            ..JwksCacheConfig::default()
        }
    }

    /// Directory fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.jwks_fetch_timeout_sec)
    }
}

/// Registry service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// External base URL for callbacks and discovery.
    pub public_base_url: String,
    /// Browser landing page after login.
    pub post_login_redirect: String,
    /// Personal-access-token cap per user.
    pub max_tokens_per_user: usize,
    /// Token list/delete calls allowed per user per minute.
    pub token_ops_per_minute: u32,
    /// GitHub OAuth app client id.
    pub github_client_id: Option<String>,
    /// GitHub OAuth app client secret.
    pub github_client_secret: Option<String>,
    /// Failed bearer-auth attempts allowed per IP per minute.
    pub failed_auth_per_minute: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: "http://localhost:8080".to_string(),
            post_login_redirect: "/".to_string(),
            max_tokens_per_user: 10,
            token_ops_per_minute: 30,
            github_client_id: None,
            github_client_secret: None,
            failed_auth_per_minute: 30,
        }
    }
}

/// Certificate authority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Path to the CA certificate PEM. CA routes 501 when unset.
    pub cert_path: Option<String>,
    /// Path to the CA private key PEM.
    pub key_path: Option<String>,
    /// Leaf validity in days.
    pub leaf_valid_days: i64,
    /// Issuance cap per agent per day.
    pub max_issues_per_agent_per_day: usize,
    /// Active-certificate cap per (agent, kid).
    pub max_active_per_kid: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            leaf_valid_days: 90,
            max_issues_per_agent_per_day: 10,
            max_active_per_kid: 1,
        }
    }
}

impl CaConfig {
    /// The CA policy derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> CaSettings {
        CaSettings {
            leaf_valid_days: self.leaf_valid_days,
            max_issues_per_agent_per_day: self.max_issues_per_agent_per_day,
            max_active_per_kid: self.max_active_per_kid,
        }
    }
}

/// Session cookie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HMAC secret for cookie binding. Generated (and logged as a warning)
    /// when unset - sessions then die with the process.
    pub secret: Option<String>,
    /// Session lifetime in days.
    pub ttl_days: i64,
    /// Set the `Secure` cookie attribute.
    pub secure: bool,
    /// Cookie name.
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_days: 30,
            secure: false,
            cookie_name: "oba_session".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OBA_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
        config.apply_env_aliases();
        Ok(config)
    }

    /// Honor the short deployment-contract environment names.
    fn apply_env_aliases(&mut self) {
        if let Some(v) = env_parse::<i64>("MAX_SKEW_SEC") {
            self.verifier.max_skew_sec = v;
        }
        if let Some(v) = env_parse::<u64>("NONCE_TTL_SEC") {
            self.verifier.nonce_ttl_sec = v;
        }
        if let Ok(v) = env::var("TRUSTED_DIRECTORIES") {
            self.verifier.trusted_directories = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("REQUIRE_TAG") {
            self.verifier.require_tag = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env_parse::<i64>("LEAF_CERT_VALID_DAYS") {
            self.ca.leaf_valid_days = v;
        }
        if let Some(v) = env_parse::<usize>("CERT_MAX_ISSUES_PER_AGENT_PER_DAY") {
            self.ca.max_issues_per_agent_per_day = v;
        }
        if let Some(v) = env_parse::<usize>("CERT_MAX_ACTIVE_PER_KID") {
            self.ca.max_active_per_kid = v;
        }
        if let Ok(v) = env::var("SESSION_SECRET") {
            if !v.is_empty() {
                self.session.secret = Some(v);
            }
        }
        if let Some(v) = env_parse::<i64>("SESSION_TTL_DAYS") {
            self.session.ttl_days = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
