//! Registry records: users, profiles, keys, agents, certificates, sessions,
//! and personal access tokens.
//!
//! All ownership is hierarchical - a `User` owns everything below it, an
//! `Agent` owns its certificates - and deletion cascades downstream.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Jwk;

/// A registered human owner. Created on first OAuth login; disabled, never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable internal identifier.
    pub id: Uuid,
    /// External identity provider, e.g. `github`.
    pub provider: String,
    /// Provider-scoped account id.
    pub provider_id: String,
    /// Display handle from the provider.
    pub handle: String,
    /// Avatar URL from the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Disabled accounts cannot authenticate.
    #[serde(default)]
    pub disabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Web-Bot-Auth directory metadata, 1:1 with [`User`].
///
/// `username` is unique, case-preserving, and case-insensitive for lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Owning user.
    pub user_id: Uuid,
    /// Canonical username.
    pub username: String,
    /// Client display name shown to publishers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Homepage of the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    /// Logo URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    /// Contact addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<String>,
    /// User-Agent string the bot is expected to send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_user_agent: Option<String>,
    /// RFC 9309 product token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfc9309_product_token: Option<String>,
    /// RFC 9309 compliance flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rfc9309_compliance: Vec<String>,
    /// What triggers a crawl.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Crawl purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Content the bot targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targeted_content: Option<String>,
    /// Rate-control mechanism description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control: Option<String>,
    /// Expected request rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_expectation: Option<String>,
    /// URLs operated by this identity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_urls: Vec<String>,
    /// Whether non-owners may read this user's telemetry.
    #[serde(default)]
    pub is_public: bool,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// One Ed25519 public key in a user's history. Append-only; the latest
/// active row is the current key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Stable row identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Base64url public key material (the JWK `x` member).
    pub x: String,
    /// Whether this is the current key.
    pub active: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Serving; keys published in the owner's directory.
    Active,
    /// Temporarily suspended by the owner.
    Paused,
    /// Retired.
    Inactive,
}

/// A named sub-identity of a user with its own key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable internal identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Type tag, e.g. `crawler` or `assistant`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Lifecycle state.
    pub status: AgentStatus,
    /// The agent's public key in JWK form.
    pub jwk: Jwk,
    /// Structured agent identifier `agent:LOCAL@HOST[/RESOURCE]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oba_agent_id: Option<String>,
    /// Delegating parent agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oba_parent_agent_id: Option<String>,
    /// Principal on whose behalf the agent acts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oba_principal: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// RFC 5280 revocation reasons, wire-encoded lowercase snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// No stated reason.
    Unspecified,
    /// The private key was compromised.
    KeyCompromise,
    /// The issuing CA was compromised.
    CaCompromise,
    /// The subject's affiliation changed.
    AffiliationChanged,
    /// Replaced by a newer certificate.
    Superseded,
    /// The subject ceased operation.
    CessationOfOperation,
    /// Temporarily held.
    CertificateHold,
    /// Privileges withdrawn.
    PrivilegeWithdrawn,
    /// Removal from CRL.
    RemoveFromCrl,
    /// Attribute authority compromised.
    AaCompromise,
}

impl FromStr for RevocationReason {
    type Err = ();

    /// Case-insensitive; `-` accepted as `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "key_compromise" => Ok(Self::KeyCompromise),
            "ca_compromise" => Ok(Self::CaCompromise),
            "affiliation_changed" => Ok(Self::AffiliationChanged),
            "superseded" => Ok(Self::Superseded),
            "cessation_of_operation" => Ok(Self::CessationOfOperation),
            "certificate_hold" => Ok(Self::CertificateHold),
            "privilege_withdrawn" => Ok(Self::PrivilegeWithdrawn),
            "remove_from_crl" => Ok(Self::RemoveFromCrl),
            "aa_compromise" => Ok(Self::AaCompromise),
            _ => Err(()),
        }
    }
}

/// A leaf X.509 certificate over an agent's Ed25519 key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCertificate {
    /// Unique serial (hex) across all certificates from one CA instance.
    pub serial: String,
    /// Owning agent.
    pub agent_id: Uuid,
    /// Owning user, denormalized for directory assembly.
    pub user_id: Uuid,
    /// JWK thumbprint of the certified key.
    pub kid: String,
    /// PEM of the leaf certificate.
    pub leaf_pem: String,
    /// PEM of the chain (leaf + issuers).
    pub chain_pem: String,
    /// Base64 DER of each chain element, leaf first.
    pub x5c: Vec<String>,
    /// Validity start.
    pub not_before: DateTime<Utc>,
    /// Validity end.
    pub not_after: DateTime<Utc>,
    /// SHA-256 over the leaf DER, 64 lowercase hex chars.
    pub fingerprint_sha256: String,
    /// Revocation time; revocation is irreversible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Revocation reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<RevocationReason>,
    /// Issuance time.
    pub created_at: DateTime<Utc>,
}

impl AgentCertificate {
    /// Unrevoked and inside the validity window.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.not_before <= now && now <= self.not_after
    }
}

/// An opaque cookie-bound session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id, also the cookie payload.
    pub id: String,
    /// Authenticated user.
    pub user_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Personal-access-token scopes. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Read agents.
    #[serde(rename = "agents:read")]
    AgentsRead,
    /// Create/update/delete agents; issue certificates.
    #[serde(rename = "agents:write")]
    AgentsWrite,
    /// Read keys and history.
    #[serde(rename = "keys:read")]
    KeysRead,
    /// Register keys.
    #[serde(rename = "keys:write")]
    KeysWrite,
    /// Read the profile.
    #[serde(rename = "profile:read")]
    ProfileRead,
    /// Update the profile.
    #[serde(rename = "profile:write")]
    ProfileWrite,
}

impl Scope {
    /// Every member of the closed set.
    pub const ALL: [Self; 6] = [
        Self::AgentsRead,
        Self::AgentsWrite,
        Self::KeysRead,
        Self::KeysWrite,
        Self::ProfileRead,
        Self::ProfileWrite,
    ];
}

impl FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agents:read" => Ok(Self::AgentsRead),
            "agents:write" => Ok(Self::AgentsWrite),
            "keys:read" => Ok(Self::KeysRead),
            "keys:write" => Ok(Self::KeysWrite),
            "profile:read" => Ok(Self::ProfileRead),
            "profile:write" => Ok(Self::ProfileWrite),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentsRead => "agents:read",
            Self::AgentsWrite => "agents:write",
            Self::KeysRead => "keys:read",
            Self::KeysWrite => "keys:write",
            Self::ProfileRead => "profile:read",
            Self::ProfileWrite => "profile:write",
        };
        write!(f, "{s}")
    }
}

/// A personal access token. The raw value is returned exactly once at
/// creation; only its SHA-256 is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Display name.
    pub name: String,
    /// SHA-256 hex of the raw token.
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// Short display prefix, `oba_XXXX`.
    pub prefix: String,
    /// Granted scopes.
    pub scopes: Vec<Scope>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Last successful authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    /// Whether the token has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this token grants `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// One verification attempt, appended by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// Registry username of the signer.
    pub username: String,
    /// Target origin.
    pub origin: String,
    /// HTTP method.
    pub method: String,
    /// Outcome.
    pub verified: bool,
    /// When the verification ran.
    pub at: DateTime<Utc>,
}

/// A self-reported agent activity entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentActivity {
    /// The agent this entry belongs to (internal id or `oba_agent_id`).
    pub agent_id: String,
    /// Action label.
    pub action: String,
    /// Free-form detail payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// ── Format validation ─────────────────────────────────────────────────────────

static AGENT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^agent:[A-Za-z0-9._-]+@[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)?$")
        .expect("static regex")
});

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,38}$").expect("static regex"));

static FINGERPRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("static regex"));

/// Validate an `agent:LOCAL@HOST[/RESOURCE]` identifier.
#[must_use]
pub fn is_valid_agent_id(id: &str) -> bool {
    id.len() <= 255 && AGENT_ID_RE.is_match(id)
}

/// Validate a username.
#[must_use]
pub fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

/// Validate a certificate fingerprint: 64 lowercase hex characters.
#[must_use]
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    FINGERPRINT_RE.is_match(fingerprint)
}

/// Parse a list of scope strings, rejecting anything outside the closed set.
pub fn parse_scopes(raw: &[String]) -> Result<Vec<Scope>, String> {
    let mut scopes = Vec::with_capacity(raw.len());
    for s in raw {
        let scope = Scope::from_str(s).map_err(|()| format!("unknown scope: {s}"))?;
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_grammar() {
        assert!(is_valid_agent_id("agent:crawler@example.com"));
        assert!(is_valid_agent_id("agent:crawler@example.com/news"));
        assert!(is_valid_agent_id("agent:a.b-c_d@sub.example.com/r.1"));

        assert!(!is_valid_agent_id("crawler@example.com"));
        assert!(!is_valid_agent_id("agent:crawler"));
        assert!(!is_valid_agent_id("agent:craw ler@example.com"));
        assert!(!is_valid_agent_id("agent:c@e/x/y"));
        assert!(!is_valid_agent_id(&format!(
            "agent:{}@example.com",
            "a".repeat(300)
        )));
    }

    #[test]
    fn username_grammar() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("Alice-2"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("-leading"));
        assert!(!is_valid_username("has space"));
        assert!(!is_valid_username(&"a".repeat(40)));
    }

    #[test]
    fn fingerprint_grammar() {
        assert!(is_valid_fingerprint(&"a".repeat(64)));
        assert!(!is_valid_fingerprint(&"A".repeat(64)));
        assert!(!is_valid_fingerprint(&"a".repeat(63)));
        assert!(!is_valid_fingerprint("xyz"));
    }

    #[test]
    fn revocation_reason_parsing_is_lenient() {
        assert_eq!(
            "KEY-COMPROMISE".parse::<RevocationReason>(),
            Ok(RevocationReason::KeyCompromise)
        );
        assert_eq!(
            "cessation_of_operation".parse::<RevocationReason>(),
            Ok(RevocationReason::CessationOfOperation)
        );
        assert!("definitely-not-a-reason".parse::<RevocationReason>().is_err());
    }

    #[test]
    fn revocation_reason_serializes_snake_case() {
        let json = serde_json::to_string(&RevocationReason::KeyCompromise).unwrap();
        assert_eq!(json, "\"key_compromise\"");
    }

    #[test]
    fn scope_round_trips_through_serde() {
        let json = serde_json::to_string(&Scope::AgentsWrite).unwrap();
        assert_eq!(json, "\"agents:write\"");
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Scope::AgentsWrite);
    }

    #[test]
    fn parse_scopes_rejects_unknown_and_dedups() {
        let ok = parse_scopes(&["agents:read".into(), "agents:read".into()]).unwrap();
        assert_eq!(ok, vec![Scope::AgentsRead]);

        assert!(parse_scopes(&["admin:everything".into()]).is_err());
    }

    #[test]
    fn certificate_activity_window() {
        let now = Utc::now();
        let cert = AgentCertificate {
            serial: "01".into(),
            agent_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kid: "k".into(),
            leaf_pem: String::new(),
            chain_pem: String::new(),
            x5c: vec![],
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::days(1),
            fingerprint_sha256: "f".repeat(64),
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        };
        assert!(cert.is_active(now));

        let mut revoked = cert.clone();
        revoked.revoked_at = Some(now);
        assert!(!revoked.is_active(now));

        let mut expired = cert;
        expired.not_after = now - chrono::Duration::hours(1);
        assert!(!expired.is_active(now));
    }

    #[test]
    fn token_hash_never_serializes() {
        let token = ApiToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "ci".into(),
            token_hash: "deadbeef".into(),
            prefix: "oba_dead".into(),
            scopes: vec![Scope::AgentsRead],
            expires_at: Utc::now() + chrono::Duration::days(30),
            last_used_at: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&token).unwrap();
        assert!(!json.contains("deadbeef"));
    }
}
