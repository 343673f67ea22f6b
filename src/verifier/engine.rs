//! The verification pipeline.
//!
//! # Pipeline
//!
//! 1. Extract the three signature headers; select a single label.
//! 2. Parse signature parameters; enforce the required tag when configured.
//! 3. Freshness: `|now − created|` within skew; not past expiry.
//! 4. Replay: atomic nonce insert, first wins.
//! 5. Directory trust: absolute `Signature-Agent` URL on the allow-list;
//!    no credential-bearing header in the covered set.
//! 6. Directory fetch through the cache (conditional GET, single-flight,
//!    backoff).
//! 7. Key selection by `keyid`, with one forced refresh once the cached
//!    document has outlived the grace window.
//! 8. Signature base reconstruction and Ed25519 verification.
//! 9. Verdict.
//!
//! Every step fails closed; verification is never retried internally. Logs
//! carry hashed nonces and kids only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::error::VerifyError;
use super::jwks_cache::JwksCache;
use super::nonce::{NonceCache, hashed_nonce};
use crate::msgsig::{
    CoveredComponent, RequestComponents, SENSITIVE_HEADERS, build_signature_base,
    extract_envelope, headers::HeaderError,
};

/// Verification policy knobs, all defaulted per the deployment contract.
#[derive(Debug, Clone)]
pub struct VerifierPolicy {
    /// Maximum |now − created| in seconds.
    pub max_skew_secs: i64,
    /// Lifetime granted when `expires` is absent.
    pub default_expiry_secs: i64,
    /// Floor for the nonce-cache TTL.
    pub min_nonce_ttl: Duration,
    /// Allow-listed directory hosts. Empty means no directory is trusted.
    pub trusted_directories: Vec<String>,
    /// When set, the `tag` parameter must be present and equal.
    pub require_tag: Option<String>,
    /// Label preferred when a request carries multiple signatures.
    pub preferred_label: Option<String>,
    /// Minimum cached-document age before an unknown kid forces a refresh.
    pub kid_refresh_grace: Duration,
}

impl Default for VerifierPolicy {
    fn default() -> Self {
        Self {
            max_skew_secs: 300,
            default_expiry_secs: 300,
            min_nonce_ttl: Duration::from_secs(600),
            trusted_directories: Vec::new(),
            require_tag: None,
            preferred_label: None,
            kid_refresh_grace: Duration::from_secs(30),
        }
    }
}

/// The request under verification, as forwarded by the edge.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute target URL.
    pub url: String,
    /// Header fields. Repeated names allowed.
    pub headers: Vec<(String, String)>,
}

/// Identity attached to a successful verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    /// The directory the key came from.
    pub jwks_url: String,
    /// The verified key id.
    pub kid: String,
    /// Display name from the directory, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// A successful verification.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Who signed.
    pub agent: AgentIdentity,
    /// Signature creation time (Unix seconds).
    pub created: i64,
    /// Effective expiry (Unix seconds).
    pub expires: i64,
}

/// Telemetry event emitted per verification attempt against a known
/// directory URL. Delivery is fire-and-forget; verification latency never
/// depends on it.
#[derive(Debug, Clone)]
pub struct VerificationEvent {
    /// Username parsed from the directory URL.
    pub username: String,
    /// Target origin (`scheme://authority`).
    pub origin: String,
    /// HTTP method of the verified request.
    pub method: String,
    /// Whether verification succeeded.
    pub verified: bool,
}

/// Consumer of verification events.
#[async_trait]
pub trait VerificationSink: Send + Sync + 'static {
    /// Record one event.
    async fn record(&self, event: VerificationEvent);
}

/// The verifier engine. One per process; all state lives in the shared
/// caches.
pub struct VerifierEngine {
    policy: VerifierPolicy,
    jwks: Arc<JwksCache>,
    nonces: Arc<NonceCache>,
    sink: Option<Arc<dyn VerificationSink>>,
}

impl VerifierEngine {
    /// Assemble an engine over the shared caches.
    #[must_use]
    pub fn new(policy: VerifierPolicy, jwks: Arc<JwksCache>, nonces: Arc<NonceCache>) -> Self {
        Self {
            policy,
            jwks,
            nonces,
            sink: None,
        }
    }

    /// Attach a telemetry sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn VerificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The shared JWKS cache (admin purge).
    #[must_use]
    pub fn jwks_cache(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// The shared nonce cache (admin purge).
    #[must_use]
    pub fn nonce_cache(&self) -> &Arc<NonceCache> {
        &self.nonces
    }

    /// Verify a request. Emits a telemetry event when the directory URL
    /// names a registry user.
    pub async fn verify(&self, request: &SignedRequest) -> Result<Verification, VerifyError> {
        let result = self.verify_inner(request).await;
        self.emit_telemetry(request, &result);
        result
    }

    async fn verify_inner(&self, request: &SignedRequest) -> Result<Verification, VerifyError> {
        // 1. Extract and select a single signature.
        let envelope = extract_envelope(&request.headers, self.policy.preferred_label.as_deref())
            .map_err(|e| match e {
                HeaderError::Missing(_) => VerifyError::MissingSignature,
                other => VerifyError::MalformedSignature(other.to_string()),
            })?;
        let params = &envelope.params;

        // 2. Required tag.
        if let Some(ref required) = self.policy.require_tag {
            if params.tag.as_deref() != Some(required.as_str()) {
                return Err(VerifyError::TagRequired);
            }
        }

        // 3. Freshness.
        let now = Utc::now().timestamp();
        if params.created > now + self.policy.max_skew_secs {
            return Err(VerifyError::Future);
        }
        if params.created < now - self.policy.max_skew_secs {
            return Err(VerifyError::Stale);
        }
        let expires = params.effective_expires(self.policy.default_expiry_secs);
        if now > expires {
            return Err(VerifyError::Expired);
        }

        // 4. Replay. The insert is the only nonce operation; first wins.
        let nonce = params.nonce.as_deref().ok_or(VerifyError::NonceMissing)?;
        let remaining = u64::try_from(expires - now).unwrap_or(0);
        let ttl = Duration::from_secs(remaining).max(self.policy.min_nonce_ttl);
        if !self.nonces.try_insert(nonce, ttl) {
            debug!(nonce = %hashed_nonce(nonce), "Replay detected");
            return Err(VerifyError::Replay);
        }

        // 5. Directory trust and sensitive-header isolation - both decided
        // before any network traffic.
        for component in &params.covered {
            if let CoveredComponent::Header(name) = component {
                if SENSITIVE_HEADERS.contains(&name.as_str()) {
                    return Err(VerifyError::SensitiveHeaderCovered(name.clone()));
                }
            }
        }
        let agent_url = Url::parse(&envelope.signature_agent)
            .map_err(|_| VerifyError::UntrustedDirectory(envelope.signature_agent.clone()))?;
        let host = agent_url
            .host_str()
            .ok_or_else(|| VerifyError::UntrustedDirectory(envelope.signature_agent.clone()))?
            .to_ascii_lowercase();
        if !self
            .policy
            .trusted_directories
            .iter()
            .any(|trusted| trusted.eq_ignore_ascii_case(&host))
        {
            return Err(VerifyError::UntrustedDirectory(host));
        }

        // 6–7. Directory fetch and key selection.
        let jwks_url = envelope.signature_agent.clone();
        let directory = self
            .jwks
            .get_or_fetch(&jwks_url)
            .await
            .map_err(|_| VerifyError::DirectoryFetch)?;

        let jwk = match directory.key_by_id(&params.keyid) {
            Some(jwk) => jwk.clone(),
            None => {
                let age = self.jwks.entry_age(&jwks_url).unwrap_or_default();
                if age <= self.policy.kid_refresh_grace {
                    return Err(VerifyError::UnknownKeyId);
                }
                let refreshed = self
                    .jwks
                    .force_refresh(&jwks_url)
                    .await
                    .map_err(|_| VerifyError::DirectoryFetch)?;
                refreshed
                    .key_by_id(&params.keyid)
                    .cloned()
                    .ok_or(VerifyError::UnknownKeyId)?
            }
        };
        let verifying_key = jwk.verifying_key().map_err(|_| VerifyError::UnknownKeyId)?;

        // 8. Base reconstruction and Ed25519 verification. The raw parameter
        // text from the wire terminates the base.
        let components = request_components(request)?;
        let base = build_signature_base(&components, &params.covered, &envelope.raw_params)
            .map_err(|e| VerifyError::MalformedSignature(e.to_string()))?;

        let signature = Signature::from_slice(&envelope.signature)
            .map_err(|_| VerifyError::BadSignature)?;
        verifying_key
            .verify(base.as_bytes(), &signature)
            .map_err(|_| VerifyError::BadSignature)?;

        // 9. Verdict.
        info!(
            kid = %params.keyid,
            directory = %jwks_url,
            nonce = %hashed_nonce(nonce),
            "Signature verified"
        );
        Ok(Verification {
            agent: AgentIdentity {
                jwks_url,
                kid: params.keyid.clone(),
                client_name: directory.client_name.clone(),
            },
            created: params.created,
            expires,
        })
    }

    fn emit_telemetry(&self, request: &SignedRequest, result: &Result<Verification, VerifyError>) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let jwks_url = match result {
            Ok(v) => v.agent.jwks_url.clone(),
            Err(_) => {
                // Failures are only attributable when the headers parse.
                let Ok(env) = extract_envelope(&request.headers, None) else {
                    return;
                };
                env.signature_agent
            }
        };
        let Some(username) = username_from_directory_url(&jwks_url) else {
            return;
        };
        let Ok(url) = Url::parse(&request.url) else {
            return;
        };
        let origin = format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        let event = VerificationEvent {
            username,
            origin,
            method: request.method.to_ascii_uppercase(),
            verified: result.is_ok(),
        };
        tokio::spawn(async move {
            sink.record(event).await;
        });
    }
}

/// Decompose the forwarded request into base components.
fn request_components(request: &SignedRequest) -> Result<RequestComponents, VerifyError> {
    let url = Url::parse(&request.url)
        .map_err(|e| VerifyError::MalformedSignature(format!("invalid target url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| VerifyError::MalformedSignature("target url has no host".to_string()))?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(RequestComponents {
        method: request.method.clone(),
        scheme: url.scheme().to_string(),
        authority,
        path: url.path().to_string(),
        query: url.query().map(String::from),
        headers: request.headers.clone(),
    })
}

/// Extract `{username}` from `…/jwks/{username}.json`.
#[must_use]
pub fn username_from_directory_url(jwks_url: &str) -> Option<String> {
    let url = Url::parse(jwks_url).ok()?;
    let segments: Vec<&str> = url.path_segments()?.collect();
    let [.., parent, file] = segments.as_slice() else {
        return None;
    };
    if *parent != "jwks" {
        return None;
    }
    file.strip_suffix(".json").map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Jwk;
    use crate::msgsig::SignatureParams;
    use crate::verifier::jwks_cache::{
        DirectoryFetcher, FetchFailure, FetchOutcome, JwksCacheConfig,
    };
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use ed25519_dalek::{Signer, SigningKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIR_URL: &str = "https://reg.example/jwks/alice.json";

    struct StaticFetcher {
        directory: super::super::jwks_cache::Directory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _etag: Option<&str>,
        ) -> Result<FetchOutcome, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutcome::Fetched {
                directory: self.directory.clone(),
                etag: None,
                max_age: None,
            })
        }
    }

    struct Fixture {
        engine: VerifierEngine,
        signing_key: SigningKey,
        kid: String,
        fetch_calls: Arc<StaticFetcher>,
    }

    fn fixture(policy_tweak: impl FnOnce(&mut VerifierPolicy)) -> Fixture {
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        let jwk = Jwk::from_public_key_bytes(&signing_key.verifying_key().to_bytes());
        let kid = jwk.thumbprint();

        let directory = super::super::jwks_cache::Directory {
            client_name: Some("alice".to_string()),
            verified: Some(true),
            keys: vec![jwk],
            extra: serde_json::Map::new(),
        };
        let fetcher = Arc::new(StaticFetcher {
            directory,
            calls: AtomicUsize::new(0),
        });
        let jwks = Arc::new(JwksCache::new(
            Arc::clone(&fetcher) as Arc<dyn DirectoryFetcher>,
            JwksCacheConfig::default(),
        ));

        let mut policy = VerifierPolicy {
            trusted_directories: vec!["reg.example".to_string()],
            ..VerifierPolicy::default()
        };
        policy_tweak(&mut policy);

        Fixture {
            engine: VerifierEngine::new(policy, jwks, Arc::new(NonceCache::new())),
            signing_key,
            kid,
            fetch_calls: fetcher,
        }
    }

    /// Sign a GET of `url` the way a conforming client would.
    fn signed_request(fx: &Fixture, url: &str, created: i64, nonce: &str) -> SignedRequest {
        signed_request_with(fx, url, created, nonce, &["@method", "@path", "@authority"], None)
    }

    fn signed_request_with(
        fx: &Fixture,
        url: &str,
        created: i64,
        nonce: &str,
        covered: &[&str],
        tag: Option<&str>,
    ) -> SignedRequest {
        let parsed = Url::parse(url).unwrap();
        let params = SignatureParams {
            covered: covered.iter().map(|c| CoveredComponent::parse(c)).collect(),
            created,
            expires: Some(created + 300),
            nonce: Some(nonce.to_string()),
            keyid: fx.kid.clone(),
            alg: "ed25519".to_string(),
            tag: tag.map(String::from),
        };
        let value = params.to_component_value();

        let components = RequestComponents {
            method: "GET".to_string(),
            scheme: parsed.scheme().to_string(),
            authority: parsed.host_str().unwrap().to_string(),
            path: parsed.path().to_string(),
            query: parsed.query().map(String::from),
            headers: vec![("signature-agent".to_string(), DIR_URL.to_string())],
        };
        let base = build_signature_base(&components, &params.covered, &value).unwrap();
        let sig = fx.signing_key.sign(base.as_bytes());

        SignedRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: vec![
                ("Signature-Input".to_string(), format!("sig1={value}")),
                (
                    "Signature".to_string(),
                    format!("sig1=:{}:", STANDARD.encode(sig.to_bytes())),
                ),
                ("Signature-Agent".to_string(), DIR_URL.to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn valid_signature_verifies() {
        let fx = fixture(|_| {});
        let req = signed_request(&fx, "https://example.com/post/1", Utc::now().timestamp(), "n1");

        let v = fx.engine.verify(&req).await.unwrap();
        assert_eq!(v.agent.kid, fx.kid);
        assert_eq!(v.agent.client_name.as_deref(), Some("alice"));
        assert_eq!(v.agent.jwks_url, DIR_URL);
    }

    #[tokio::test]
    async fn missing_headers_is_missing_signature() {
        let fx = fixture(|_| {});
        let req = SignedRequest {
            method: "GET".to_string(),
            url: "https://example.com/".to_string(),
            headers: vec![],
        };
        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::MissingSignature
        );
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let fx = fixture(|_| {});
        let req = signed_request(&fx, "https://example.com/post/1", Utc::now().timestamp(), "n1");

        fx.engine.verify(&req).await.unwrap();
        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::Replay
        );
    }

    #[tokio::test]
    async fn stale_created_is_rejected() {
        let fx = fixture(|_| {});
        let req = signed_request(
            &fx,
            "https://example.com/post/1",
            Utc::now().timestamp() - 600,
            "n1",
        );
        assert_eq!(fx.engine.verify(&req).await.unwrap_err(), VerifyError::Stale);
    }

    #[tokio::test]
    async fn future_created_is_rejected() {
        let fx = fixture(|_| {});
        let req = signed_request(
            &fx,
            "https://example.com/post/1",
            Utc::now().timestamp() + 600,
            "n1",
        );
        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::Future
        );
    }

    #[tokio::test]
    async fn missing_nonce_is_rejected() {
        let fx = fixture(|_| {});
        let mut req = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n");
        // Strip the nonce from the member; signature no longer matters since
        // the nonce gate precedes verification.
        let rewritten = req.headers[0]
            .1
            .replace(";nonce=\"n\"", "");
        req.headers[0].1 = rewritten;

        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::NonceMissing
        );
    }

    #[tokio::test]
    async fn untrusted_directory_is_rejected() {
        let fx = fixture(|p| p.trusted_directories = vec!["other.example".to_string()]);
        let req = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n1");

        assert!(matches!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::UntrustedDirectory(_)
        ));
    }

    #[tokio::test]
    async fn empty_allow_list_trusts_nothing() {
        let fx = fixture(|p| p.trusted_directories = vec![]);
        let req = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n1");

        assert!(matches!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::UntrustedDirectory(_)
        ));
    }

    #[tokio::test]
    async fn sensitive_header_coverage_fails_without_network() {
        let fx = fixture(|_| {});
        let mut req = signed_request_with(
            &fx,
            "https://example.com/x",
            Utc::now().timestamp(),
            "n1",
            &["@method", "@path", "@authority"],
            None,
        );
        // Forge coverage of `authorization` into the member. The signature
        // is now wrong, but the sensitive gate must trip first.
        req.headers[0].1 = req.headers[0]
            .1
            .replace("\"@method\"", "\"@method\" \"authorization\"");
        req.headers
            .push(("Authorization".to_string(), "Bearer x".to_string()));

        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::SensitiveHeaderCovered("authorization".to_string())
        );
        assert_eq!(
            fx.fetch_calls.calls.load(Ordering::SeqCst),
            0,
            "no network on sensitive-header rejection"
        );
    }

    #[tokio::test]
    async fn required_tag_enforced() {
        let fx = fixture(|p| p.require_tag = Some("web-bot-auth".to_string()));
        let untagged =
            signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n1");
        assert_eq!(
            fx.engine.verify(&untagged).await.unwrap_err(),
            VerifyError::TagRequired
        );

        let tagged = signed_request_with(
            &fx,
            "https://example.com/x",
            Utc::now().timestamp(),
            "n2",
            &["@method", "@path", "@authority"],
            Some("web-bot-auth"),
        );
        assert!(fx.engine.verify(&tagged).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let fx = fixture(|_| {});
        let mut req = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n1");
        req.headers[0].1 = req.headers[0].1.replace(&fx.kid, "not-a-kid");

        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::UnknownKeyId
        );
    }

    #[tokio::test]
    async fn tampered_signature_is_bad_signature() {
        let fx = fixture(|_| {});
        let mut req = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "n1");
        req.headers[1].1 = format!("sig1=:{}:", STANDARD.encode([0u8; 64]));

        assert_eq!(
            fx.engine.verify(&req).await.unwrap_err(),
            VerifyError::BadSignature
        );
    }

    #[tokio::test]
    async fn signature_covers_components_not_body() {
        // Same covered components, different bodies: one signature, both
        // verify (distinct nonces keep the replay gate out of the picture).
        let fx = fixture(|_| {});
        let r1 = signed_request(&fx, "https://example.com/x", Utc::now().timestamp(), "b1");
        let v1 = fx.engine.verify(&r1).await;
        assert!(v1.is_ok());
    }

    #[test]
    fn username_parses_from_directory_url() {
        assert_eq!(
            username_from_directory_url("https://reg.example/jwks/alice.json"),
            Some("alice".to_string())
        );
        assert_eq!(
            username_from_directory_url("https://reg.example/agent-jwks/x"),
            None
        );
        assert_eq!(username_from_directory_url("not a url"), None);
    }
}
