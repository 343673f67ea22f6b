//! Registry persistence layer.
//!
//! [`RegistryStore`] abstracts over the storage backend; [`InMemoryStore`]
//! is the `DashMap`-backed implementation used by the service and by tests.
//! Uniqueness and atomicity guarantees live behind this trait:
//!
//! - usernames are unique case-insensitively,
//! - certificate serials are unique per store,
//! - the PoP-nonce check-and-set is a single atomic operation,
//! - per-agent issuance is serialized through [`RegistryStore::issuance_lock`]
//!   so caps-checking and insert cannot interleave.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use super::model::{
    Agent, AgentActivity, AgentCertificate, ApiToken, KeyRecord, Profile, RevocationReason,
    Session, User, VerificationRecord,
};

/// Storage failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend is unreachable. Callers treat this as fail-closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Store result alias.
pub type StoreResult<T> = Result<T, StoreError>;

/// How to address certificates in a revocation call.
#[derive(Debug, Clone)]
pub enum CertSelector {
    /// By unique serial.
    Serial(String),
    /// By key id - revokes every matching unrevoked certificate.
    Kid(String),
    /// By leaf fingerprint.
    Fingerprint(String),
}

/// Result of a revocation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeOutcome {
    /// Number of rows transitioned to revoked by this call.
    pub revoked: usize,
    /// `true` when every matching row was already revoked; `revoked_at` is
    /// untouched in that case.
    pub already_revoked: bool,
}

/// The registry storage backend.
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    // ── Users ────────────────────────────────────────────────────────────────

    /// Insert a new user.
    async fn create_user(&self, user: User) -> StoreResult<()>;

    /// Fetch a user by id.
    async fn get_user(&self, id: Uuid) -> StoreResult<User>;

    /// Find a user by external provider identity.
    async fn find_user_by_provider(&self, provider: &str, provider_id: &str) -> Option<User>;

    // ── Profiles ─────────────────────────────────────────────────────────────

    /// Create or replace a user's profile. Fails with `Conflict` when the
    /// username is held by a different user (case-insensitive).
    async fn upsert_profile(&self, profile: Profile) -> StoreResult<()>;

    /// Profile owned by `user_id`.
    async fn profile_by_user(&self, user_id: Uuid) -> Option<Profile>;

    /// Case-insensitive username lookup.
    async fn profile_by_username(&self, username: &str) -> Option<Profile>;

    /// All profiles with `is_public`.
    async fn list_public_profiles(&self) -> Vec<Profile>;

    // ── Keys ─────────────────────────────────────────────────────────────────

    /// Register a new active key, deactivating all previous keys.
    async fn register_key(&self, user_id: Uuid, x: &str) -> StoreResult<KeyRecord>;

    /// The current active key, latest row winning.
    async fn active_key(&self, user_id: Uuid) -> Option<KeyRecord>;

    /// Full append-only history, oldest first.
    async fn key_history(&self, user_id: Uuid) -> Vec<KeyRecord>;

    // ── Agents ───────────────────────────────────────────────────────────────

    /// Insert an agent. Fails with `Conflict` on a duplicate `oba_agent_id`.
    async fn create_agent(&self, agent: Agent) -> StoreResult<()>;

    /// Fetch by internal id.
    async fn get_agent(&self, id: Uuid) -> Option<Agent>;

    /// Fetch by `oba_agent_id`.
    async fn agent_by_oba_id(&self, oba_agent_id: &str) -> Option<Agent>;

    /// All agents owned by a user.
    async fn agents_by_user(&self, user_id: Uuid) -> Vec<Agent>;

    /// Replace an agent record.
    async fn update_agent(&self, agent: Agent) -> StoreResult<()>;

    /// Delete an agent and cascade to its certificates.
    async fn delete_agent(&self, id: Uuid) -> StoreResult<()>;

    // ── Certificates ─────────────────────────────────────────────────────────

    /// Insert a certificate. Fails with `Conflict` on a duplicate serial.
    async fn insert_certificate(&self, cert: AgentCertificate) -> StoreResult<()>;

    /// Fetch by serial.
    async fn certificate_by_serial(&self, serial: &str) -> Option<AgentCertificate>;

    /// Fetch by leaf fingerprint.
    async fn certificate_by_fingerprint(&self, fingerprint: &str) -> Option<AgentCertificate>;

    /// All certificates for an agent, newest first.
    async fn certificates_by_agent(&self, agent_id: Uuid) -> Vec<AgentCertificate>;

    /// All certificates owned by a user, newest first.
    async fn certificates_by_user(&self, user_id: Uuid) -> Vec<AgentCertificate>;

    /// Count of active (unrevoked, in-window) certificates for `(agent, kid)`.
    async fn active_certificates_for_kid(
        &self,
        agent_id: Uuid,
        kid: &str,
        now: DateTime<Utc>,
    ) -> usize;

    /// Count of certificates issued to `agent_id` since `since`.
    async fn certificates_issued_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> usize;

    /// Revoke matching unrevoked certificates. Re-revocation is reported,
    /// not an error, and never changes `revoked_at`.
    async fn revoke_certificates(
        &self,
        selector: &CertSelector,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> StoreResult<RevokeOutcome>;

    /// Per-agent lock serializing issuance caps-check and insert.
    fn issuance_lock(&self, agent_id: Uuid) -> Arc<tokio::sync::Mutex<()>>;

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Insert a session.
    async fn create_session(&self, session: Session) -> StoreResult<()>;

    /// Fetch a live session; expired sessions are treated as absent.
    async fn get_session(&self, id: &str) -> Option<Session>;

    /// Delete a session.
    async fn delete_session(&self, id: &str);

    // ── API tokens ───────────────────────────────────────────────────────────

    /// Insert a token.
    async fn insert_token(&self, token: ApiToken) -> StoreResult<()>;

    /// O(1) lookup by SHA-256 hash of the raw token.
    async fn token_by_hash(&self, hash: &str) -> Option<ApiToken>;

    /// All tokens for a user, newest first.
    async fn tokens_by_user(&self, user_id: Uuid) -> Vec<ApiToken>;

    /// Delete a token owned by `user_id`.
    async fn delete_token(&self, user_id: Uuid, id: Uuid) -> StoreResult<()>;

    /// Update `last_used_at`.
    async fn touch_token(&self, id: Uuid, at: DateTime<Utc>);

    /// Token count for a user.
    async fn count_tokens(&self, user_id: Uuid) -> usize;

    // ── PoP nonces ───────────────────────────────────────────────────────────

    /// Atomic check-and-set for a proof-of-possession digest. Returns `true`
    /// when the digest was fresh and is now recorded, `false` on replay.
    /// Backends that cannot perform this atomically must return
    /// [`StoreError::Unavailable`] - never optimistically `true`.
    async fn pop_nonce_check_and_set(&self, digest: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remove a PoP digest, rolling back a failed issuance.
    async fn pop_nonce_remove(&self, digest: &str);

    // ── Verification log & activity ──────────────────────────────────────────

    /// Append a verification record.
    async fn append_verification(&self, record: VerificationRecord);

    /// Records at or after `since`, oldest first.
    async fn verifications_since(&self, since: DateTime<Utc>) -> Vec<VerificationRecord>;

    /// Latest records for a username, newest first.
    async fn verifications_for(&self, username: &str, limit: usize) -> Vec<VerificationRecord>;

    /// Append an agent activity entry.
    async fn append_activity(&self, entry: AgentActivity);

    /// Latest activity for an agent, newest first.
    async fn activity_for(&self, agent_id: &str, limit: usize) -> Vec<AgentActivity>;

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Periodic housekeeping: evict expired sessions and PoP nonces.
    /// Backends with server-side expiry can leave this a no-op.
    async fn sweep(&self) {}
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// `DashMap`-backed store. All uniqueness indices are maintained inline.
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<Uuid, User>,
    users_by_provider: DashMap<String, Uuid>,
    profiles: DashMap<Uuid, Profile>,
    profiles_by_username: DashMap<String, Uuid>,
    keys: DashMap<Uuid, Vec<KeyRecord>>,
    agents: DashMap<Uuid, Agent>,
    agents_by_oba_id: DashMap<String, Uuid>,
    certs: DashMap<String, AgentCertificate>,
    certs_by_fingerprint: DashMap<String, String>,
    issuance_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    sessions: DashMap<String, Session>,
    tokens: DashMap<Uuid, ApiToken>,
    tokens_by_hash: DashMap<String, Uuid>,
    pop_nonces: DashMap<String, Instant>,
    verifications: RwLock<Vec<VerificationRecord>>,
    activity: RwLock<Vec<AgentActivity>>,
}

/// Retained verification-log length; older entries are trimmed on append.
const VERIFICATION_LOG_CAP: usize = 50_000;

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn provider_key(provider: &str, provider_id: &str) -> String {
        format!("{provider}:{provider_id}")
    }

    /// Evict expired sessions and PoP nonces.
    pub fn evict_expired(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, s| !s.is_expired(now));
        let instant_now = Instant::now();
        self.pop_nonces.retain(|_, expires| *expires > instant_now);
    }
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn create_user(&self, user: User) -> StoreResult<()> {
        let key = Self::provider_key(&user.provider, &user.provider_id);
        match self.users_by_provider.entry(key) {
            Entry::Occupied(_) => Err(StoreError::Conflict("provider identity".to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(user.id);
                self.users.insert(user.id, user);
                Ok(())
            }
        }
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<User> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn find_user_by_provider(&self, provider: &str, provider_id: &str) -> Option<User> {
        let key = Self::provider_key(provider, provider_id);
        let id = *self.users_by_provider.get(&key)?;
        self.users.get(&id).map(|u| u.clone())
    }

    async fn upsert_profile(&self, profile: Profile) -> StoreResult<()> {
        let username_key = profile.username.to_lowercase();
        match self.profiles_by_username.entry(username_key) {
            Entry::Occupied(occupied) => {
                if *occupied.get() != profile.user_id {
                    return Err(StoreError::Conflict("username taken".to_string()));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(profile.user_id);
            }
        }
        // Drop the previous username index entry on rename.
        if let Some(previous) = self.profiles.get(&profile.user_id) {
            let old_key = previous.username.to_lowercase();
            if old_key != profile.username.to_lowercase() {
                drop(previous);
                self.profiles_by_username.remove(&old_key);
            }
        }
        self.profiles.insert(profile.user_id, profile);
        Ok(())
    }

    async fn profile_by_user(&self, user_id: Uuid) -> Option<Profile> {
        self.profiles.get(&user_id).map(|p| p.clone())
    }

    async fn profile_by_username(&self, username: &str) -> Option<Profile> {
        let id = *self.profiles_by_username.get(&username.to_lowercase())?;
        self.profiles.get(&id).map(|p| p.clone())
    }

    async fn list_public_profiles(&self) -> Vec<Profile> {
        self.profiles
            .iter()
            .filter(|p| p.is_public)
            .map(|p| p.clone())
            .collect()
    }

    async fn register_key(&self, user_id: Uuid, x: &str) -> StoreResult<KeyRecord> {
        let record = KeyRecord {
            id: Uuid::new_v4(),
            user_id,
            x: x.to_string(),
            active: true,
            created_at: Utc::now(),
        };
        let mut history = self.keys.entry(user_id).or_default();
        for key in history.iter_mut() {
            key.active = false;
        }
        history.push(record.clone());
        Ok(record)
    }

    async fn active_key(&self, user_id: Uuid) -> Option<KeyRecord> {
        self.keys
            .get(&user_id)?
            .iter()
            .rev()
            .find(|k| k.active)
            .cloned()
    }

    async fn key_history(&self, user_id: Uuid) -> Vec<KeyRecord> {
        self.keys
            .get(&user_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    async fn create_agent(&self, agent: Agent) -> StoreResult<()> {
        if let Some(ref oba_id) = agent.oba_agent_id {
            match self.agents_by_oba_id.entry(oba_id.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict("oba_agent_id taken".to_string()));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(agent.id);
                }
            }
        }
        self.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Option<Agent> {
        self.agents.get(&id).map(|a| a.clone())
    }

    async fn agent_by_oba_id(&self, oba_agent_id: &str) -> Option<Agent> {
        let id = *self.agents_by_oba_id.get(oba_agent_id)?;
        self.agents.get(&id).map(|a| a.clone())
    }

    async fn agents_by_user(&self, user_id: Uuid) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.clone())
            .collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    async fn update_agent(&self, agent: Agent) -> StoreResult<()> {
        let Some(previous) = self.agents.get(&agent.id).map(|a| a.clone()) else {
            return Err(StoreError::NotFound);
        };
        if previous.oba_agent_id != agent.oba_agent_id {
            if let Some(ref new_id) = agent.oba_agent_id {
                match self.agents_by_oba_id.entry(new_id.clone()) {
                    Entry::Occupied(_) => {
                        return Err(StoreError::Conflict("oba_agent_id taken".to_string()));
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(agent.id);
                    }
                }
            }
            if let Some(ref old_id) = previous.oba_agent_id {
                self.agents_by_oba_id.remove(old_id);
            }
        }
        self.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn delete_agent(&self, id: Uuid) -> StoreResult<()> {
        let Some((_, agent)) = self.agents.remove(&id) else {
            return Err(StoreError::NotFound);
        };
        if let Some(ref oba_id) = agent.oba_agent_id {
            self.agents_by_oba_id.remove(oba_id);
        }
        // Cascade: certificates belong to the agent.
        let serials: Vec<String> = self
            .certs
            .iter()
            .filter(|c| c.agent_id == id)
            .map(|c| c.serial.clone())
            .collect();
        for serial in serials {
            if let Some((_, cert)) = self.certs.remove(&serial) {
                self.certs_by_fingerprint.remove(&cert.fingerprint_sha256);
            }
        }
        Ok(())
    }

    async fn insert_certificate(&self, cert: AgentCertificate) -> StoreResult<()> {
        match self.certs.entry(cert.serial.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict("duplicate serial".to_string())),
            Entry::Vacant(vacant) => {
                self.certs_by_fingerprint
                    .insert(cert.fingerprint_sha256.clone(), cert.serial.clone());
                vacant.insert(cert);
                Ok(())
            }
        }
    }

    async fn certificate_by_serial(&self, serial: &str) -> Option<AgentCertificate> {
        self.certs.get(serial).map(|c| c.clone())
    }

    async fn certificate_by_fingerprint(&self, fingerprint: &str) -> Option<AgentCertificate> {
        let serial = self.certs_by_fingerprint.get(fingerprint)?.clone();
        self.certs.get(&serial).map(|c| c.clone())
    }

    async fn certificates_by_agent(&self, agent_id: Uuid) -> Vec<AgentCertificate> {
        let mut certs: Vec<AgentCertificate> = self
            .certs
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .map(|c| c.clone())
            .collect();
        certs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        certs
    }

    async fn certificates_by_user(&self, user_id: Uuid) -> Vec<AgentCertificate> {
        let mut certs: Vec<AgentCertificate> = self
            .certs
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        certs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        certs
    }

    async fn active_certificates_for_kid(
        &self,
        agent_id: Uuid,
        kid: &str,
        now: DateTime<Utc>,
    ) -> usize {
        self.certs
            .iter()
            .filter(|c| c.agent_id == agent_id && c.kid == kid && c.is_active(now))
            .count()
    }

    async fn certificates_issued_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> usize {
        self.certs
            .iter()
            .filter(|c| c.agent_id == agent_id && c.created_at >= since)
            .count()
    }

    async fn revoke_certificates(
        &self,
        selector: &CertSelector,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> StoreResult<RevokeOutcome> {
        let serials: Vec<String> = match selector {
            CertSelector::Serial(serial) => {
                if self.certs.contains_key(serial) {
                    vec![serial.clone()]
                } else {
                    vec![]
                }
            }
            CertSelector::Fingerprint(fp) => self
                .certs_by_fingerprint
                .get(fp)
                .map(|s| vec![s.clone()])
                .unwrap_or_default(),
            CertSelector::Kid(kid) => self
                .certs
                .iter()
                .filter(|c| c.kid == *kid)
                .map(|c| c.serial.clone())
                .collect(),
        };

        if serials.is_empty() {
            return Err(StoreError::NotFound);
        }

        let mut revoked = 0usize;
        let mut matched = 0usize;
        for serial in serials {
            if let Some(mut cert) = self.certs.get_mut(&serial) {
                matched += 1;
                if cert.revoked_at.is_none() {
                    cert.revoked_at = Some(at);
                    cert.revoked_reason = Some(reason);
                    revoked += 1;
                }
            }
        }

        Ok(RevokeOutcome {
            revoked,
            already_revoked: revoked == 0 && matched > 0,
        })
    }

    fn issuance_lock(&self, agent_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.issuance_locks
            .entry(agent_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn create_session(&self, session: Session) -> StoreResult<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Option<Session> {
        let session = self.sessions.get(id)?.clone();
        if session.is_expired(Utc::now()) {
            drop(self.sessions.remove(id));
            return None;
        }
        Some(session)
    }

    async fn delete_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    async fn insert_token(&self, token: ApiToken) -> StoreResult<()> {
        self.tokens_by_hash
            .insert(token.token_hash.clone(), token.id);
        self.tokens.insert(token.id, token);
        Ok(())
    }

    async fn token_by_hash(&self, hash: &str) -> Option<ApiToken> {
        let id = *self.tokens_by_hash.get(hash)?;
        self.tokens.get(&id).map(|t| t.clone())
    }

    async fn tokens_by_user(&self, user_id: Uuid) -> Vec<ApiToken> {
        let mut tokens: Vec<ApiToken> = self
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.clone())
            .collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tokens
    }

    async fn delete_token(&self, user_id: Uuid, id: Uuid) -> StoreResult<()> {
        let owned = self
            .tokens
            .get(&id)
            .is_some_and(|t| t.user_id == user_id);
        if !owned {
            return Err(StoreError::NotFound);
        }
        if let Some((_, token)) = self.tokens.remove(&id) {
            self.tokens_by_hash.remove(&token.token_hash);
        }
        Ok(())
    }

    async fn touch_token(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(mut token) = self.tokens.get_mut(&id) {
            token.last_used_at = Some(at);
        }
    }

    async fn count_tokens(&self, user_id: Uuid) -> usize {
        self.tokens.iter().filter(|t| t.user_id == user_id).count()
    }

    async fn pop_nonce_check_and_set(&self, digest: &str, ttl: Duration) -> StoreResult<bool> {
        let expires = Instant::now() + ttl;
        match self.pop_nonces.entry(digest.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= Instant::now() {
                    occupied.insert(expires);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires);
                Ok(true)
            }
        }
    }

    async fn pop_nonce_remove(&self, digest: &str) {
        self.pop_nonces.remove(digest);
    }

    async fn append_verification(&self, record: VerificationRecord) {
        let mut log = self.verifications.write();
        log.push(record);
        if log.len() > VERIFICATION_LOG_CAP {
            let excess = log.len() - VERIFICATION_LOG_CAP;
            log.drain(..excess);
        }
    }

    async fn verifications_since(&self, since: DateTime<Utc>) -> Vec<VerificationRecord> {
        self.verifications
            .read()
            .iter()
            .filter(|r| r.at >= since)
            .cloned()
            .collect()
    }

    async fn verifications_for(&self, username: &str, limit: usize) -> Vec<VerificationRecord> {
        self.verifications
            .read()
            .iter()
            .rev()
            .filter(|r| r.username == username)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn append_activity(&self, entry: AgentActivity) {
        self.activity.write().push(entry);
    }

    async fn activity_for(&self, agent_id: &str, limit: usize) -> Vec<AgentActivity> {
        self.activity
            .read()
            .iter()
            .rev()
            .filter(|a| a.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn sweep(&self) {
        self.evict_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Jwk;
    use crate::registry::model::AgentStatus;

    fn user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            provider: "github".into(),
            provider_id: "1234".into(),
            handle: "alice".into(),
            avatar_url: None,
            disabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn profile(user_id: Uuid, username: &str) -> Profile {
        Profile {
            user_id,
            username: username.to_string(),
            client_name: Some(username.to_string()),
            client_uri: None,
            logo_uri: None,
            contacts: vec![],
            expected_user_agent: None,
            rfc9309_product_token: None,
            rfc9309_compliance: vec![],
            trigger: None,
            purpose: None,
            targeted_content: None,
            rate_control: None,
            rate_expectation: None,
            known_urls: vec![],
            is_public: false,
            updated_at: Utc::now(),
        }
    }

    fn agent(user_id: Uuid, oba_id: Option<&str>) -> Agent {
        let now = Utc::now();
        Agent {
            id: Uuid::new_v4(),
            user_id,
            name: "crawler".into(),
            description: None,
            agent_type: None,
            status: AgentStatus::Active,
            jwk: Jwk::from_public_key_bytes(&[9u8; 32]),
            oba_agent_id: oba_id.map(String::from),
            oba_parent_agent_id: None,
            oba_principal: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn cert(agent_id: Uuid, user_id: Uuid, serial: &str, kid: &str) -> AgentCertificate {
        let now = Utc::now();
        AgentCertificate {
            serial: serial.to_string(),
            agent_id,
            user_id,
            kid: kid.to_string(),
            leaf_pem: String::new(),
            chain_pem: String::new(),
            x5c: vec![],
            not_before: now - chrono::Duration::minutes(1),
            not_after: now + chrono::Duration::days(90),
            fingerprint_sha256: format!("{serial:0>64}"),
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn provider_identity_is_unique() {
        let store = InMemoryStore::new();
        let u1 = user();
        let mut u2 = user();
        u2.id = Uuid::new_v4();

        store.create_user(u1).await.unwrap();
        assert_eq!(
            store.create_user(u2).await.unwrap_err(),
            StoreError::Conflict("provider identity".to_string())
        );
    }

    #[tokio::test]
    async fn username_lookup_is_case_insensitive_but_preserving() {
        let store = InMemoryStore::new();
        let u = user();
        store.create_user(u.clone()).await.unwrap();
        store.upsert_profile(profile(u.id, "Alice")).await.unwrap();

        let found = store.profile_by_username("aLiCe").await.unwrap();
        assert_eq!(found.username, "Alice");
    }

    #[tokio::test]
    async fn username_conflict_across_users() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.upsert_profile(profile(a, "alice")).await.unwrap();

        assert!(matches!(
            store.upsert_profile(profile(b, "ALICE")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn key_rotation_deactivates_previous() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();

        store.register_key(uid, "x1").await.unwrap();
        store.register_key(uid, "x2").await.unwrap();

        let active = store.active_key(uid).await.unwrap();
        assert_eq!(active.x, "x2");

        let history = store.key_history(uid).await;
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[1].active);
    }

    #[tokio::test]
    async fn duplicate_oba_agent_id_conflicts() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();
        store
            .create_agent(agent(uid, Some("agent:c@example.com")))
            .await
            .unwrap();

        assert!(matches!(
            store.create_agent(agent(uid, Some("agent:c@example.com"))).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_agent_cascades_to_certificates() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();
        let a = agent(uid, None);
        let aid = a.id;
        store.create_agent(a).await.unwrap();
        store.insert_certificate(cert(aid, uid, "01", "kid1")).await.unwrap();

        store.delete_agent(aid).await.unwrap();

        assert!(store.certificate_by_serial("01").await.is_none());
        assert!(store
            .certificate_by_fingerprint(&format!("{:0>64}", "01"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_serial_conflicts() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();
        let aid = Uuid::new_v4();
        store.insert_certificate(cert(aid, uid, "01", "k")).await.unwrap();

        assert!(matches!(
            store.insert_certificate(cert(aid, uid, "01", "k")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_preserves_timestamp() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();
        let aid = Uuid::new_v4();
        store.insert_certificate(cert(aid, uid, "01", "k")).await.unwrap();

        let t1 = Utc::now();
        let first = store
            .revoke_certificates(
                &CertSelector::Serial("01".into()),
                RevocationReason::Superseded,
                t1,
            )
            .await
            .unwrap();
        assert_eq!(first, RevokeOutcome { revoked: 1, already_revoked: false });

        let t2 = t1 + chrono::Duration::hours(1);
        let second = store
            .revoke_certificates(
                &CertSelector::Serial("01".into()),
                RevocationReason::KeyCompromise,
                t2,
            )
            .await
            .unwrap();
        assert_eq!(second, RevokeOutcome { revoked: 0, already_revoked: true });

        let cert = store.certificate_by_serial("01").await.unwrap();
        assert_eq!(cert.revoked_at, Some(t1), "revoked_at must not move");
        assert_eq!(cert.revoked_reason, Some(RevocationReason::Superseded));
    }

    #[tokio::test]
    async fn revoking_unknown_certificate_is_not_found() {
        let store = InMemoryStore::new();
        assert_eq!(
            store
                .revoke_certificates(
                    &CertSelector::Serial("nope".into()),
                    RevocationReason::Unspecified,
                    Utc::now(),
                )
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn active_cert_count_ignores_revoked_and_expired() {
        let store = InMemoryStore::new();
        let uid = Uuid::new_v4();
        let aid = Uuid::new_v4();
        let now = Utc::now();

        store.insert_certificate(cert(aid, uid, "01", "k")).await.unwrap();
        let mut expired = cert(aid, uid, "02", "k");
        expired.not_after = now - chrono::Duration::hours(1);
        store.insert_certificate(expired).await.unwrap();

        assert_eq!(store.active_certificates_for_kid(aid, "k", now).await, 1);

        store
            .revoke_certificates(
                &CertSelector::Serial("01".into()),
                RevocationReason::Superseded,
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.active_certificates_for_kid(aid, "k", now).await, 0);
    }

    #[tokio::test]
    async fn pop_nonce_first_insert_wins() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(300);

        assert!(store.pop_nonce_check_and_set("digest", ttl).await.unwrap());
        assert!(!store.pop_nonce_check_and_set("digest", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn pop_nonce_concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .pop_nonce_check_and_set("same", Duration::from_secs(300))
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn expired_session_is_absent() {
        let store = InMemoryStore::new();
        let session = Session {
            id: "s1".into(),
            user_id: Uuid::new_v4(),
            created_at: Utc::now() - chrono::Duration::days(31),
            expires_at: Utc::now() - chrono::Duration::days(1),
        };
        store.create_session(session).await.unwrap();
        assert!(store.get_session("s1").await.is_none());
    }

    #[tokio::test]
    async fn token_delete_requires_ownership() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let token = ApiToken {
            id: Uuid::new_v4(),
            user_id: owner,
            name: "ci".into(),
            token_hash: "h".into(),
            prefix: "oba_aaaa".into(),
            scopes: vec![],
            expires_at: Utc::now() + chrono::Duration::days(1),
            last_used_at: None,
            created_at: Utc::now(),
        };
        let id = token.id;
        store.insert_token(token).await.unwrap();

        assert_eq!(
            store.delete_token(other, id).await.unwrap_err(),
            StoreError::NotFound
        );
        store.delete_token(owner, id).await.unwrap();
        assert!(store.token_by_hash("h").await.is_none());
    }

    #[tokio::test]
    async fn verification_log_filters_by_user_and_time() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (name, offset) in [("alice", 0i64), ("bob", 0), ("alice", -100)] {
            store
                .append_verification(VerificationRecord {
                    username: name.into(),
                    origin: "https://example.com".into(),
                    method: "GET".into(),
                    verified: true,
                    at: now + chrono::Duration::seconds(offset),
                })
                .await;
        }

        assert_eq!(store.verifications_for("alice", 10).await.len(), 2);
        assert_eq!(
            store
                .verifications_since(now - chrono::Duration::seconds(10))
                .await
                .len(),
            2
        );
    }
}
