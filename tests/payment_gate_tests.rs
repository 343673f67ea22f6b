//! The 402 loop at the interface level: challenge emission, receipt
//! validation, and the client-side challenge parser.

use std::sync::Arc;

use openbotauth::policy::{
    ContentPolicy, Decision, HashBoundReceipts, PayGate, Verdict, request_hash,
};
use openbotauth::signer::parse_challenge;
use openbotauth::verifier::AgentIdentity;

/// Paywalls `/premium/…`, denies `/private/…`, throttles `/busy/…`,
/// serves everything else.
struct DemoPolicy;

impl ContentPolicy for DemoPolicy {
    fn decide(&self, resource: &str, _agent: &AgentIdentity) -> Decision {
        if resource.starts_with("/premium/") {
            Decision::Pay {
                price: "0.05 USD".to_string(),
                pay_url: "https://pay.example/checkout".to_string(),
            }
        } else if resource.starts_with("/private/") {
            Decision::Deny
        } else if resource.starts_with("/busy/") {
            Decision::Throttle {
                retry_after_secs: 30,
            }
        } else {
            Decision::Full
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
    PayGate::new(Arc::new(DemoPolicy), Arc::new(HashBoundReceipts))
}

#[tokio::test]
async fn free_resource_allows() {
    let verdict = gate()
        .evaluate("/post/1", &agent(), "GET", 1_700_000_000, None)
        .await;
    assert_eq!(verdict, Verdict::Allow);
}

#[tokio::test]
async fn paid_resource_challenges_then_accepts_receipt() {
    let gate = gate();

    // First pass: no receipt, expect the full 402 challenge.
    let verdict = gate
        .evaluate("/premium/report", &agent(), "GET", 1_700_000_000, None)
        .await;
    let Verdict::Pay {
        price,
        request_hash: hash,
        pay_url,
    } = verdict.clone()
    else {
        panic!("expected Pay verdict");
    };
    assert_eq!(price, "0.05 USD");
    assert_eq!(pay_url, "https://pay.example/checkout");

    // The challenge headers round-trip through the client-side parser.
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in verdict.challenge_headers() {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    let challenge = parse_challenge(&headers).unwrap();
    assert_eq!(challenge.request_hash, hash);
    assert_eq!(challenge.pay_url, "https://pay.example/checkout");

    // Second pass: matching receipt settles the challenge.
    let settled = gate
        .evaluate(
            "/premium/report",
            &agent(),
            "GET",
            1_700_000_000,
            Some(&format!("rcpt_{hash}")),
        )
        .await;
    assert_eq!(settled, Verdict::Allow);
}

#[tokio::test]
async fn mismatched_receipt_is_denied_not_rechallenged() {
    let wrong_hash = request_hash("GET", "/premium/other", 1_700_000_000, "kid1");
    let verdict = gate()
        .evaluate(
            "/premium/report",
            &agent(),
            "GET",
            1_700_000_000,
            Some(&format!("rcpt_{wrong_hash}")),
        )
        .await;
    assert_eq!(
        verdict,
        Verdict::Deny {
            reason: "receipt_invalid".to_string()
        }
    );
}

#[tokio::test]
async fn deny_and_throttle_pass_through() {
    let gate = gate();
    assert_eq!(
        gate.evaluate("/private/x", &agent(), "GET", 1, None).await,
        Verdict::Deny {
            reason: "policy".to_string()
        }
    );
    assert_eq!(
        gate.evaluate("/busy/x", &agent(), "GET", 1, None).await,
        Verdict::RateLimit {
            retry_after_secs: 30
        }
    );
}

#[tokio::test]
async fn request_hash_binds_method_path_created_and_kid() {
    let baseline = request_hash("GET", "/premium/report", 1_700_000_000, "kid1");
    assert_ne!(baseline, request_hash("POST", "/premium/report", 1_700_000_000, "kid1"));
    assert_ne!(baseline, request_hash("GET", "/premium/other", 1_700_000_000, "kid1"));
    assert_ne!(baseline, request_hash("GET", "/premium/report", 1_700_000_001, "kid1"));
    assert_ne!(baseline, request_hash("GET", "/premium/report", 1_700_000_000, "kid2"));
}
