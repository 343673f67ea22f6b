//! Bot-side request signing and the 402 payment loop.
//!
//! [`RequestSigner`] produces the three signature headers for an outgoing
//! request; [`SignedClient`] wraps a `reqwest` client that signs every
//! request and, on a 402 challenge, acquires a receipt through the
//! configured [`PaymentHandler`], re-signs from scratch, and retries once.
//!
//! Signing has no suspension points: key, nonce, and base construction are
//! all local.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rand::{Rng, RngExt};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::crypto::Jwk;
use crate::msgsig::{
    BaseError, CoveredComponent, RequestComponents, SignatureParams, build_signature_base,
};

/// Default signature lifetime.
const DEFAULT_EXPIRY_SECS: i64 = 300;
/// Default signature label.
const DEFAULT_LABEL: &str = "sig1";

/// Signing failures.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The target URL did not parse or has no host.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// Base construction failed (missing covered header, unknown derived
    /// component).
    #[error(transparent)]
    Base(#[from] BaseError),

    /// Transport failure from the wrapped client.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server demanded payment and no handler produced a receipt.
    #[error("payment required and no receipt available")]
    PaymentUnresolved,
}

/// Which components a signature covers.
#[derive(Debug, Clone)]
pub struct CoveredComponents(Vec<CoveredComponent>);

impl CoveredComponents {
    /// The default profile: `@method`, `@path`, `@authority`.
    #[must_use]
    pub fn standard() -> Self {
        Self::custom(&["@method", "@path", "@authority"])
    }

    /// The strict profile: the default set plus the `signature-agent`
    /// header, binding the directory URL into the signature.
    #[must_use]
    pub fn strict() -> Self {
        Self::custom(&["@method", "@path", "@authority", "signature-agent"])
    }

    /// An arbitrary component list.
    #[must_use]
    pub fn custom(names: &[&str]) -> Self {
        Self(names.iter().map(|n| CoveredComponent::parse(n)).collect())
    }

    /// The component list.
    #[must_use]
    pub fn components(&self) -> &[CoveredComponent] {
        &self.0
    }
}

impl Default for CoveredComponents {
    fn default() -> Self {
        Self::standard()
    }
}

/// The three headers attached to a signed request.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// `Signature-Input` value.
    pub signature_input: String,
    /// `Signature` value.
    pub signature: String,
    /// `Signature-Agent` value.
    pub signature_agent: String,
}

impl SignatureHeaders {
    /// Header name/value pairs ready to attach.
    #[must_use]
    pub fn as_tuples(&self) -> [(&'static str, String); 3] {
        [
            ("Signature-Input", self.signature_input.clone()),
            ("Signature", self.signature.clone()),
            ("Signature-Agent", self.signature_agent.clone()),
        ]
    }
}

/// Signs requests with one Ed25519 key published in one directory.
pub struct RequestSigner {
    signing_key: SigningKey,
    kid: String,
    jwks_url: String,
    label: String,
    covered: CoveredComponents,
    tag: Option<String>,
    expiry_secs: i64,
}

impl RequestSigner {
    /// Create a signer. The kid is the canonical thumbprint of the
    /// signing key's public half.
    #[must_use]
    pub fn new(signing_key: SigningKey, jwks_url: impl Into<String>) -> Self {
        let jwk = Jwk::from_public_key_bytes(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            kid: jwk.thumbprint(),
            jwks_url: jwks_url.into(),
            label: DEFAULT_LABEL.to_string(),
            covered: CoveredComponents::standard(),
            tag: None,
            expiry_secs: DEFAULT_EXPIRY_SECS,
        }
    }

    /// Override the kid (legacy-kid signing for deprecation tests).
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = kid.into();
        self
    }

    /// Override the covered-components profile.
    #[must_use]
    pub fn with_covered(mut self, covered: CoveredComponents) -> Self {
        self.covered = covered;
        self
    }

    /// Attach a `tag` parameter.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Override the signature label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The signer's key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign `method` + `url` (+ `extra_headers` available as literal
    /// components) and return the three headers.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        extra_headers: &[(String, String)],
    ) -> Result<SignatureHeaders, SignerError> {
        let parsed = Url::parse(url).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SignerError::InvalidUrl("missing host".to_string()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let now = Utc::now().timestamp();
        let nonce_bytes: [u8; 16] = rand::rng().random();
        let params = SignatureParams {
            covered: self.covered.components().to_vec(),
            created: now,
            expires: Some(now + self.expiry_secs),
            nonce: Some(URL_SAFE_NO_PAD.encode(nonce_bytes)),
            keyid: self.kid.clone(),
            alg: "ed25519".to_string(),
            tag: self.tag.clone(),
        };
        let params_value = params.to_component_value();

        // `signature-agent` is always available as a literal component so
        // the strict profile can bind it.
        let mut headers = extra_headers.to_vec();
        headers.push(("signature-agent".to_string(), self.jwks_url.clone()));

        let components = RequestComponents {
            method: method.to_string(),
            scheme: parsed.scheme().to_string(),
            authority,
            path: parsed.path().to_string(),
            query: parsed.query().map(String::from),
            headers,
        };
        let base = build_signature_base(&components, params.covered.as_slice(), &params_value)?;
        let signature = self.signing_key.sign(base.as_bytes());

        Ok(SignatureHeaders {
            signature_input: format!("{}={params_value}", self.label),
            signature: format!("{}=:{}:", self.label, STANDARD.encode(signature.to_bytes())),
            signature_agent: self.jwks_url.clone(),
        })
    }
}

// ── Payment loop ──────────────────────────────────────────────────────────────

/// A parsed 402 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChallenge {
    /// `OpenBotAuth-Price`, e.g. `0.01 USD`.
    pub price: String,
    /// `OpenBotAuth-Request-Hash` binding the challenge to the request.
    pub request_hash: String,
    /// The `Link; rel="payment"` URL.
    pub pay_url: String,
}

/// Extract the challenge from a 402 response's headers.
#[must_use]
pub fn parse_challenge(headers: &reqwest::header::HeaderMap) -> Option<PaymentChallenge> {
    let price = headers.get("OpenBotAuth-Price")?.to_str().ok()?.to_string();
    let request_hash = headers
        .get("OpenBotAuth-Request-Hash")?
        .to_str()
        .ok()?
        .to_string();
    let pay_url = headers
        .get_all("link")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_payment_link)?;
    Some(PaymentChallenge {
        price,
        request_hash,
        pay_url,
    })
}

/// Parse `<url>; rel="payment"` out of a Link header value.
fn parse_payment_link(value: &str) -> Option<String> {
    for part in value.split(',') {
        let part = part.trim();
        let url = part
            .strip_prefix('<')
            .and_then(|rest| rest.split_once('>'))
            .map(|(url, _)| url)?;
        let is_payment = part
            .split(';')
            .skip(1)
            .any(|param| {
                let param = param.trim();
                param.eq_ignore_ascii_case("rel=\"payment\"")
                    || param.eq_ignore_ascii_case("rel=payment")
            });
        if is_payment {
            return Some(url.to_string());
        }
    }
    None
}

/// Acquires receipts for payment challenges (out of band).
#[async_trait]
pub trait PaymentHandler: Send + Sync + 'static {
    /// Return an opaque receipt for the challenge, or `None` to give up.
    async fn acquire_receipt(&self, challenge: &PaymentChallenge) -> Option<String>;
}

/// A signing HTTP client with a bounded 402 retry.
pub struct SignedClient {
    http: reqwest::Client,
    signer: RequestSigner,
    payments: Option<Arc<dyn PaymentHandler>>,
    retry_budget: usize,
}

impl SignedClient {
    /// Wrap a signer with a fresh HTTP client.
    #[must_use]
    pub fn new(signer: RequestSigner) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            signer,
            payments: None,
            retry_budget: 1,
        }
    }

    /// Attach a payment handler for 402 challenges.
    #[must_use]
    pub fn with_payment_handler(mut self, handler: Arc<dyn PaymentHandler>) -> Self {
        self.payments = Some(handler);
        self
    }

    /// Send a signed request; on a 402, acquire a receipt, re-sign, and
    /// retry within the budget.
    pub async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> Result<reqwest::Response, SignerError> {
        let mut receipt: Option<String> = None;
        let mut attempts_left = self.retry_budget + 1;

        loop {
            attempts_left -= 1;
            let response = self.send_once(method.clone(), url, receipt.as_deref()).await?;

            if response.status() != reqwest::StatusCode::PAYMENT_REQUIRED || attempts_left == 0 {
                return Ok(response);
            }
            let Some(handler) = &self.payments else {
                return Ok(response);
            };
            let Some(challenge) = parse_challenge(response.headers()) else {
                return Ok(response);
            };
            debug!(price = %challenge.price, pay_url = %challenge.pay_url, "Payment challenge");

            match handler.acquire_receipt(&challenge).await {
                Some(acquired) => receipt = Some(acquired),
                None => return Err(SignerError::PaymentUnresolved),
            }
            // Loop: the retry gets a fresh nonce and created timestamp.
        }
    }

    async fn send_once(
        &self,
        method: reqwest::Method,
        url: &str,
        receipt: Option<&str>,
    ) -> Result<reqwest::Response, SignerError> {
        let headers = self.signer.sign(method.as_str(), url, &[])?;

        let mut request = self.http.request(method, url);
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }
        if let Some(receipt) = receipt {
            request = request.header("OpenBotAuth-Receipt", receipt);
        }
        Ok(request.send().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgsig::extract_envelope;
    use pretty_assertions::assert_eq;

    fn signer() -> RequestSigner {
        RequestSigner::new(
            SigningKey::from_bytes(&[5u8; 32]),
            "https://reg.example/jwks/alice.json",
        )
    }

    #[test]
    fn emitted_headers_parse_back() {
        let headers = signer().sign("GET", "https://example.com/post/1", &[]).unwrap();

        let as_pairs = headers
            .as_tuples()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<Vec<_>>();
        let envelope = extract_envelope(&as_pairs, None).unwrap();

        assert_eq!(envelope.label, "sig1");
        assert_eq!(envelope.params.alg, "ed25519");
        assert_eq!(envelope.params.covered.len(), 3);
        assert_eq!(envelope.signature.len(), 64);
        assert_eq!(
            envelope.signature_agent,
            "https://reg.example/jwks/alice.json"
        );
    }

    #[test]
    fn nonce_is_unique_per_signature() {
        let signer = signer();
        let a = signer.sign("GET", "https://example.com/", &[]).unwrap();
        let b = signer.sign("GET", "https://example.com/", &[]).unwrap();
        assert_ne!(a.signature_input, b.signature_input);
    }

    #[test]
    fn nonce_is_16_bytes_base64url() {
        let headers = signer().sign("GET", "https://example.com/", &[]).unwrap();
        let pairs: Vec<(String, String)> = headers
            .as_tuples()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let envelope = extract_envelope(&pairs, None).unwrap();
        let nonce = envelope.params.nonce.unwrap();

        assert_eq!(URL_SAFE_NO_PAD.decode(nonce.as_bytes()).unwrap().len(), 16);
    }

    #[test]
    fn strict_profile_covers_signature_agent() {
        let signer = signer().with_covered(CoveredComponents::strict());
        let headers = signer.sign("GET", "https://example.com/x", &[]).unwrap();
        assert!(headers.signature_input.contains("\"signature-agent\""));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(
            signer().sign("GET", "not a url", &[]),
            Err(SignerError::InvalidUrl(_))
        ));
    }

    #[test]
    fn payment_link_parsing() {
        assert_eq!(
            parse_payment_link("<https://pay.example/x>; rel=\"payment\""),
            Some("https://pay.example/x".to_string())
        );
        assert_eq!(
            parse_payment_link("<https://pay.example/x>; rel=\"next\""),
            None
        );
        assert_eq!(parse_payment_link("garbage"), None);
    }

    #[test]
    fn challenge_requires_all_three_parts() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("OpenBotAuth-Price", "0.01 USD".parse().unwrap());
        assert!(parse_challenge(&headers).is_none());

        headers.insert("OpenBotAuth-Request-Hash", "abc123".parse().unwrap());
        headers.insert(
            "link",
            "<https://pay.example/co>; rel=\"payment\"".parse().unwrap(),
        );
        let challenge = parse_challenge(&headers).unwrap();
        assert_eq!(challenge.price, "0.01 USD");
        assert_eq!(challenge.pay_url, "https://pay.example/co");
    }
}
