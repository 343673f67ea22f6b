//! Per-request verdicts and the publisher-side pay gate.
//!
//! The verdict is the typed outcome a content host acts on: serve, deny,
//! demand payment, or throttle. The gate itself is an interface - the
//! content host supplies a [`ContentPolicy`] deciding what a resource
//! costs, and a [`ReceiptVerifier`] validating opaque receipts. The
//! built-in [`HashBoundReceipts`] accepts receipts bound to the request
//! hash, which is enough for the stub payment loop; real processors plug
//! in behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::verifier::AgentIdentity;

/// The typed outcome of gating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Serve full content.
    Allow,
    /// Refuse with a reason code.
    Deny {
        /// Machine-readable reason.
        reason: String,
    },
    /// Demand payment via the 402 loop.
    Pay {
        /// Price string, e.g. `0.01 USD`.
        price: String,
        /// Hash binding the challenge to this request.
        request_hash: String,
        /// Payment URL for the `Link; rel="payment"` header.
        pay_url: String,
    },
    /// Throttle the caller.
    RateLimit {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },
}

impl Verdict {
    /// The 402 challenge headers for a `Pay` verdict; empty otherwise.
    #[must_use]
    pub fn challenge_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Pay {
                price,
                request_hash,
                pay_url,
            } => vec![
                ("OpenBotAuth-Price", price.clone()),
                ("OpenBotAuth-Request-Hash", request_hash.clone()),
                ("Link", format!("<{pay_url}>; rel=\"payment\"")),
            ],
            _ => Vec::new(),
        }
    }
}

/// What a policy decides for a (resource, agent) pair, before receipts are
/// considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Serve full content.
    Full,
    /// Serve the teaser rendition.
    Teaser,
    /// Paid resource.
    Pay {
        /// Price string.
        price: String,
        /// Payment URL.
        pay_url: String,
    },
    /// Never serve this caller.
    Deny,
    /// Throttle.
    Throttle {
        /// Retry delay in seconds.
        retry_after_secs: u64,
    },
}

/// Publisher-supplied access policy.
pub trait ContentPolicy: Send + Sync + 'static {
    /// Decide access for a verified agent on a resource path.
    fn decide(&self, resource: &str, agent: &AgentIdentity) -> Decision;
}

/// Validates opaque receipts presented with a re-signed request.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync + 'static {
    /// `true` when the receipt settles a challenge for `request_hash`.
    async fn verify(&self, receipt: &str, request_hash: &str) -> bool;
}

/// Stub receipt scheme: a receipt is valid iff it is `rcpt_{request_hash}`.
/// Stands in for an external settlement service.
#[derive(Debug, Default)]
pub struct HashBoundReceipts;

#[async_trait]
impl ReceiptVerifier for HashBoundReceipts {
    async fn verify(&self, receipt: &str, request_hash: &str) -> bool {
        receipt
            .strip_prefix("rcpt_")
            .is_some_and(|bound| bound == request_hash)
    }
}

/// The request hash bound into 402 challenges:
/// hex SHA-256 of `method|path|created|kid`.
#[must_use]
pub fn request_hash(method: &str, path: &str, created: i64, kid: &str) -> String {
    let input = format!("{}|{path}|{created}|{kid}", method.to_ascii_uppercase());
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// The pay gate: policy + receipt validation → verdict.
pub struct PayGate {
    policy: Arc<dyn ContentPolicy>,
    receipts: Arc<dyn ReceiptVerifier>,
}

impl PayGate {
    /// Assemble a gate.
    #[must_use]
    pub fn new(policy: Arc<dyn ContentPolicy>, receipts: Arc<dyn ReceiptVerifier>) -> Self {
        Self { policy, receipts }
    }

    /// Gate one verified request.
    ///
    /// `created` is the verified signature's creation time; `receipt` is
    /// the `OpenBotAuth-Receipt` header when present. A valid receipt
    /// upgrades a `Pay` decision to `Allow`; an invalid receipt on a paid
    /// resource is a deny, not another challenge.
    pub async fn evaluate(
        &self,
        resource: &str,
        agent: &AgentIdentity,
        method: &str,
        created: i64,
        receipt: Option<&str>,
    ) -> Verdict {
        match self.policy.decide(resource, agent) {
            Decision::Full | Decision::Teaser => Verdict::Allow,
            Decision::Deny => Verdict::Deny {
                reason: "policy".to_string(),
            },
            Decision::Throttle { retry_after_secs } => Verdict::RateLimit { retry_after_secs },
            Decision::Pay { price, pay_url } => {
                let hash = request_hash(method, resource, created, &agent.kid);
                match receipt {
                    Some(receipt) if self.receipts.verify(receipt, &hash).await => Verdict::Allow,
                    Some(_) => Verdict::Deny {
                        reason: "receipt_invalid".to_string(),
                    },
                    None => Verdict::Pay {
                        price,
                        request_hash: hash,
                        pay_url,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PayEverything;

    impl ContentPolicy for PayEverything {
        fn decide(&self, _resource: &str, _agent: &AgentIdentity) -> Decision {
            Decision::Pay {
                price: "0.01 USD".to_string(),
                pay_url: "https://pay.example/co".to_string(),
            }
        }
    }

    fn agent() -> AgentIdentity {
        AgentIdentity {
            jwks_url: "https://reg.example/jwks/alice.json".to_string(),
            kid: "kid1".to_string(),
            client_name: Some("alice".to_string()),
        }
    }

    fn gate() -> PayGate {
        PayGate::new(Arc::new(PayEverything), Arc::new(HashBoundReceipts))
    }

    #[test]
    fn request_hash_is_stable_and_method_insensitive() {
        let a = request_hash("get", "/post/1", 1_700_000_000, "kid1");
        let b = request_hash("GET", "/post/1", 1_700_000_000, "kid1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = request_hash("GET", "/post/2", 1_700_000_000, "kid1");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn pay_decision_without_receipt_challenges() {
        let verdict = gate()
            .evaluate("/post/1", &agent(), "GET", 1_700_000_000, None)
            .await;

        let Verdict::Pay { price, request_hash: hash, pay_url } = verdict else {
            panic!("expected Pay verdict");
        };
        assert_eq!(price, "0.01 USD");
        assert_eq!(pay_url, "https://pay.example/co");
        assert_eq!(hash, request_hash("GET", "/post/1", 1_700_000_000, "kid1"));
    }

    #[tokio::test]
    async fn matching_receipt_allows() {
        let hash = request_hash("GET", "/post/1", 1_700_000_000, "kid1");
        let verdict = gate()
            .evaluate(
                "/post/1",
                &agent(),
                "GET",
                1_700_000_000,
                Some(&format!("rcpt_{hash}")),
            )
            .await;
        assert_eq!(verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn mismatched_receipt_denies() {
        let wrong = request_hash("GET", "/other", 1_700_000_000, "kid1");
        let verdict = gate()
            .evaluate(
                "/post/1",
                &agent(),
                "GET",
                1_700_000_000,
                Some(&format!("rcpt_{wrong}")),
            )
            .await;
        assert_eq!(
            verdict,
            Verdict::Deny {
                reason: "receipt_invalid".to_string()
            }
        );
    }

    #[test]
    fn challenge_headers_only_for_pay() {
        let pay = Verdict::Pay {
            price: "1 USD".to_string(),
            request_hash: "h".to_string(),
            pay_url: "https://pay.example".to_string(),
        };
        let headers = pay.challenge_headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[2].1, "<https://pay.example>; rel=\"payment\"");

        assert!(Verdict::Allow.challenge_headers().is_empty());
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let json = serde_json::to_value(Verdict::RateLimit {
            retry_after_secs: 30,
        })
        .unwrap();
        assert_eq!(json["verdict"], "rate_limit");
        assert_eq!(json["retry_after_secs"], 30);
    }
}
