//! Extraction of the three signature headers from a request.
//!
//! `Signature-Input` and `Signature` are structured-field dictionaries; a
//! request may carry several labeled signatures. This module selects exactly
//! one label: the single member when unambiguous, or the configured
//! preferred label when more than one is present.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use super::params::{ParamError, SignatureParams};

/// Errors from header extraction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// One of the three required headers is absent.
    #[error("missing required header: {0}")]
    Missing(&'static str),

    /// `Signature-Input` or `Signature` could not be parsed.
    #[error("malformed signature header: {0}")]
    Malformed(String),

    /// Multiple labels present and none matches the preferred label.
    #[error("ambiguous signature labels")]
    AmbiguousLabel,

    /// The selected label has no matching `Signature` member.
    #[error("no signature for label: {0}")]
    LabelMismatch(String),

    /// Parameter grammar error inside the selected member.
    #[error(transparent)]
    Params(#[from] ParamError),
}

/// One fully-extracted signature: label, parsed parameters, the raw
/// parameter text (for byte-exact base reconstruction), the decoded
/// signature bytes, and the directory URL.
#[derive(Debug, Clone)]
pub struct SignatureEnvelope {
    /// The selected signature label, e.g. `sig1`.
    pub label: String,
    /// Structured parameters.
    pub params: SignatureParams,
    /// The member value exactly as received, used verbatim in the
    /// `"@signature-params"` base line.
    pub raw_params: String,
    /// Decoded signature bytes.
    pub signature: Vec<u8>,
    /// The `Signature-Agent` value.
    pub signature_agent: String,
}

/// Extract and select a single signature from the request headers.
///
/// `headers` is the full header list; lookup is case-insensitive. When the
/// dictionaries contain more than one label, `preferred_label` (when
/// configured and present) wins; otherwise the ambiguity is rejected.
pub fn extract_envelope(
    headers: &[(String, String)],
    preferred_label: Option<&str>,
) -> Result<SignatureEnvelope, HeaderError> {
    let input = header_value(headers, "signature-input")
        .ok_or(HeaderError::Missing("Signature-Input"))?;
    let signature = header_value(headers, "signature")
        .ok_or(HeaderError::Missing("Signature"))?;
    let agent = header_value(headers, "signature-agent")
        .ok_or(HeaderError::Missing("Signature-Agent"))?;

    let input_members = split_dictionary(&input)?;
    let (label, raw_params) = select_label(&input_members, preferred_label)?;

    let sig_members = split_dictionary(&signature)?;
    let sig_value = sig_members
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, v)| v.clone())
        .ok_or_else(|| HeaderError::LabelMismatch(label.clone()))?;

    let params = SignatureParams::parse(&raw_params)?;
    let signature = decode_byte_sequence(&sig_value)?;

    Ok(SignatureEnvelope {
        label,
        params,
        raw_params,
        signature,
        signature_agent: strip_sf_string(agent.trim()),
    })
}

/// Join all values of a header, comma-separated, as HTTP permits splitting
/// dictionaries across repeated fields.
fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// Split a dictionary into `(label, member-value)` pairs, respecting quoted
/// strings and inner lists.
fn split_dictionary(value: &str) -> Result<Vec<(String, String)>, HeaderError> {
    let mut members = Vec::new();
    for part in split_top_level(value) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let eq = part
            .find('=')
            .ok_or_else(|| HeaderError::Malformed(format!("member without '=': {part}")))?;
        let label = part[..eq].trim();
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*'))
        {
            return Err(HeaderError::Malformed(format!("invalid label: {label}")));
        }
        members.push((label.to_string(), part[eq + 1..].trim().to_string()));
    }
    if members.is_empty() {
        return Err(HeaderError::Malformed("empty dictionary".to_string()));
    }
    Ok(members)
}

/// Split on commas outside quotes and parentheses.
fn split_top_level(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn select_label(
    members: &[(String, String)],
    preferred: Option<&str>,
) -> Result<(String, String), HeaderError> {
    if members.len() == 1 {
        return Ok(members[0].clone());
    }
    if let Some(want) = preferred {
        if let Some(found) = members.iter().find(|(l, _)| l == want) {
            return Ok(found.clone());
        }
    }
    Err(HeaderError::AmbiguousLabel)
}

/// Decode a structured-field byte sequence `:base64:`.
fn decode_byte_sequence(value: &str) -> Result<Vec<u8>, HeaderError> {
    let inner = value
        .strip_prefix(':')
        .and_then(|v| v.strip_suffix(':'))
        .ok_or_else(|| HeaderError::Malformed("signature is not a byte sequence".to_string()))?;
    STANDARD
        .decode(inner.as_bytes())
        .map_err(|_| HeaderError::Malformed("invalid base64 in signature".to_string()))
}

/// `Signature-Agent` may be sent as a bare URL or an sf-string.
fn strip_sf_string(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PARAMS: &str =
        "(\"@method\" \"@path\" \"@authority\");created=1700000000;nonce=\"n\";keyid=\"k\";alg=\"ed25519\"";

    fn headers(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut h = vec![
            ("Signature-Input".to_string(), format!("sig1={PARAMS}")),
            ("Signature".to_string(), "sig1=:aGVsbG8=:".to_string()),
            (
                "Signature-Agent".to_string(),
                "https://reg.example/jwks/alice.json".to_string(),
            ),
        ];
        for (k, v) in extra {
            h.push(((*k).to_string(), (*v).to_string()));
        }
        h
    }

    #[test]
    fn extracts_single_label() {
        let env = extract_envelope(&headers(&[]), None).unwrap();

        assert_eq!(env.label, "sig1");
        assert_eq!(env.raw_params, PARAMS);
        assert_eq!(env.signature, b"hello");
        assert_eq!(env.signature_agent, "https://reg.example/jwks/alice.json");
    }

    #[test]
    fn missing_signature_input_reported_by_name() {
        let h: Vec<(String, String)> = headers(&[])
            .into_iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("signature-input"))
            .collect();
        assert_eq!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::Missing("Signature-Input")
        );
    }

    #[test]
    fn missing_signature_agent_reported_by_name() {
        let h: Vec<(String, String)> = headers(&[])
            .into_iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("signature-agent"))
            .collect();
        assert_eq!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::Missing("Signature-Agent")
        );
    }

    #[test]
    fn two_labels_without_preference_is_ambiguous() {
        let mut h = headers(&[]);
        h[0].1 = format!("sig1={PARAMS}, sig2={PARAMS}");
        h[1].1 = "sig1=:aGVsbG8=:, sig2=:aGVsbG8=:".to_string();

        assert_eq!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::AmbiguousLabel
        );
    }

    #[test]
    fn preferred_label_resolves_ambiguity() {
        let mut h = headers(&[]);
        h[0].1 = format!("sig1={PARAMS}, sig2={PARAMS}");
        h[1].1 = "sig1=:aGVsbG8=:, sig2=:d29ybGQ=:".to_string();

        let env = extract_envelope(&h, Some("sig2")).unwrap();
        assert_eq!(env.label, "sig2");
        assert_eq!(env.signature, b"world");
    }

    #[test]
    fn commas_inside_inner_list_do_not_split_members() {
        // A quoted component name containing a comma must not break the
        // dictionary split.
        let tricky = "(\"@method\" \"x,y\");created=1;keyid=\"k\";alg=\"ed25519\"";
        let mut h = headers(&[]);
        h[0].1 = format!("sig1={tricky}");

        let env = extract_envelope(&h, None).unwrap();
        assert_eq!(env.raw_params, tricky);
    }

    #[test]
    fn signature_label_must_match_input_label() {
        let mut h = headers(&[]);
        h[1].1 = "other=:aGVsbG8=:".to_string();

        assert_eq!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::LabelMismatch("sig1".to_string())
        );
    }

    #[test]
    fn signature_must_be_byte_sequence() {
        let mut h = headers(&[]);
        h[1].1 = "sig1=aGVsbG8=".to_string();

        assert!(matches!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::Malformed(_)
        ));
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let mut h = headers(&[]);
        h[1].1 = "sig1=:!!not-base64!!:".to_string();

        assert!(matches!(
            extract_envelope(&h, None).unwrap_err(),
            HeaderError::Malformed(_)
        ));
    }

    #[test]
    fn quoted_signature_agent_is_unwrapped() {
        let mut h = headers(&[]);
        h[2].1 = "\"https://reg.example/jwks/alice.json\"".to_string();

        let env = extract_envelope(&h, None).unwrap();
        assert_eq!(env.signature_agent, "https://reg.example/jwks/alice.json");
    }
}
