//! Signature parameter grammar - the member value of `Signature-Input`.
//!
//! A member looks like:
//!
//! ```text
//! ("@method" "@path" "@authority");created=1700000000;expires=1700000300;nonce="4pT…";keyid="NzbL…";alg="ed25519"
//! ```
//!
//! Parsing keeps the raw text alongside the structured form: the verifier
//! reconstructs the `"@signature-params"` base line from the raw text, while
//! freshness and key-selection logic read the structured fields.

use std::fmt;

use thiserror::Error;

/// Errors from parsing a `Signature-Input` member value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// The member value did not start with an inner list.
    #[error("expected inner list of covered components")]
    MissingInnerList,

    /// The inner list was not closed or an item was not a quoted string.
    #[error("malformed inner list: {0}")]
    MalformedInnerList(String),

    /// A `;key=value` parameter could not be parsed.
    #[error("malformed parameter: {0}")]
    MalformedParameter(String),

    /// A required parameter was absent.
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// A parameter had the wrong value type.
    #[error("parameter '{0}' has wrong type")]
    WrongType(&'static str),

    /// The `alg` parameter named an unsupported algorithm.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// A parameter value: integer, string, or inner list of strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Bare integer, e.g. `created=1700000000`.
    Int(i64),
    /// Quoted string, e.g. `keyid="abc"`.
    Str(String),
    /// Inner list of quoted strings, e.g. `("@method" "@path")`.
    InnerList(Vec<String>),
}

/// A covered component name from the inner list.
///
/// Derived components start with `@`; anything else is a literal header
/// name, stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoveredComponent {
    /// `@method`, `@authority`, `@path`, `@query`, `@target-uri`,
    /// `@scheme`, `@request-target`.
    Derived(String),
    /// A lowercased header field name.
    Header(String),
}

impl CoveredComponent {
    /// Parse a component name as it appears inside the inner list.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        if name.starts_with('@') {
            Self::Derived(name.to_ascii_lowercase())
        } else {
            Self::Header(name.to_ascii_lowercase())
        }
    }

    /// The component name as it appears quoted in the inner list.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Derived(n) | Self::Header(n) => n,
        }
    }
}

impl fmt::Display for CoveredComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parsed signature parameters for one signature label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParams {
    /// Covered components in the order they were listed.
    pub covered: Vec<CoveredComponent>,
    /// `created` - signing time, Unix seconds. Required.
    pub created: i64,
    /// `expires` - absolute expiry, Unix seconds.
    pub expires: Option<i64>,
    /// `nonce` - replay-defense value.
    pub nonce: Option<String>,
    /// `keyid` - key identifier within the signer's directory. Required.
    pub keyid: String,
    /// `alg` - algorithm label; only `ed25519` is accepted.
    pub alg: String,
    /// `tag` - application tag, e.g. `web-bot-auth`.
    pub tag: Option<String>,
}

impl SignatureParams {
    /// Parse a member value (`("…" …);k=v;…`) into structured parameters.
    pub fn parse(member: &str) -> Result<Self, ParamError> {
        let member = member.trim();
        let (items, rest) = parse_inner_list(member)?;
        let pairs = parse_parameters(rest)?;

        let mut created = None;
        let mut expires = None;
        let mut nonce = None;
        let mut keyid = None;
        let mut alg = None;
        let mut tag = None;

        for (key, value) in pairs {
            match key.as_str() {
                "created" => created = Some(expect_int("created", &value)?),
                "expires" => expires = Some(expect_int("expires", &value)?),
                "nonce" => nonce = Some(expect_str("nonce", &value)?),
                "keyid" => keyid = Some(expect_str("keyid", &value)?),
                "alg" => alg = Some(expect_str("alg", &value)?),
                "tag" => tag = Some(expect_str("tag", &value)?),
                // Unknown parameters are preserved in the raw text used for
                // base reconstruction; they carry no verification semantics.
                _ => {}
            }
        }

        let alg = alg.ok_or(ParamError::MissingParameter("alg"))?;
        if !alg.eq_ignore_ascii_case("ed25519") {
            return Err(ParamError::UnsupportedAlgorithm(alg));
        }

        Ok(Self {
            covered: items.iter().map(|s| CoveredComponent::parse(s)).collect(),
            created: created.ok_or(ParamError::MissingParameter("created"))?,
            expires,
            nonce,
            keyid: keyid.ok_or(ParamError::MissingParameter("keyid"))?,
            alg,
            tag,
        })
    }

    /// Serialize to the canonical member value used by the signer.
    ///
    /// Emission order is fixed: inner list, `created`, `expires`, `nonce`,
    /// `keyid`, `alg`, `tag`.
    #[must_use]
    pub fn to_component_value(&self) -> String {
        let list = self
            .covered
            .iter()
            .map(|c| format!("\"{}\"", c.name()))
            .collect::<Vec<_>>()
            .join(" ");

        let mut out = format!("({list});created={}", self.created);
        if let Some(expires) = self.expires {
            out.push_str(&format!(";expires={expires}"));
        }
        if let Some(ref nonce) = self.nonce {
            out.push_str(&format!(";nonce=\"{nonce}\""));
        }
        out.push_str(&format!(";keyid=\"{}\"", self.keyid));
        out.push_str(&format!(";alg=\"{}\"", self.alg));
        if let Some(ref tag) = self.tag {
            out.push_str(&format!(";tag=\"{tag}\""));
        }
        out
    }

    /// Effective expiry: explicit `expires`, else `created + default`.
    #[must_use]
    pub fn effective_expires(&self, default_expiry_secs: i64) -> i64 {
        self.expires
            .unwrap_or_else(|| self.created.saturating_add(default_expiry_secs))
    }
}

fn expect_int(name: &'static str, value: &ParamValue) -> Result<i64, ParamError> {
    match value {
        ParamValue::Int(i) => Ok(*i),
        _ => Err(ParamError::WrongType(name)),
    }
}

fn expect_str(name: &'static str, value: &ParamValue) -> Result<String, ParamError> {
    match value {
        ParamValue::Str(s) => Ok(s.clone()),
        _ => Err(ParamError::WrongType(name)),
    }
}

/// Parse the leading inner list; returns the items and the remaining text
/// (starting at the first `;`, or empty).
fn parse_inner_list(input: &str) -> Result<(Vec<String>, &str), ParamError> {
    let rest = input
        .strip_prefix('(')
        .ok_or(ParamError::MissingInnerList)?;

    let close = find_unquoted(rest, ')')
        .ok_or_else(|| ParamError::MalformedInnerList("unterminated list".to_string()))?;
    let body = &rest[..close];
    let after = &rest[close + 1..];

    let mut items = Vec::new();
    let mut remaining = body;
    loop {
        remaining = remaining.trim_start();
        if remaining.is_empty() {
            break;
        }
        let tail = remaining.strip_prefix('"').ok_or_else(|| {
            ParamError::MalformedInnerList(format!("expected quoted string at '{remaining}'"))
        })?;
        let end = tail.find('"').ok_or_else(|| {
            ParamError::MalformedInnerList("unterminated quoted string".to_string())
        })?;
        items.push(tail[..end].to_string());
        remaining = &tail[end + 1..];
    }

    Ok((items, after))
}

/// Parse `;key=value` pairs after the inner list.
fn parse_parameters(input: &str) -> Result<Vec<(String, ParamValue)>, ParamError> {
    let mut pairs = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        rest = rest
            .strip_prefix(';')
            .ok_or_else(|| ParamError::MalformedParameter(format!("expected ';' before '{rest}'")))?
            .trim_start();

        let eq = rest
            .find('=')
            .ok_or_else(|| ParamError::MalformedParameter("missing '='".to_string()))?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];

        let (value, after) = parse_value(rest)?;
        pairs.push((key, value));
        rest = after.trim_start();
    }

    Ok(pairs)
}

fn parse_value(input: &str) -> Result<(ParamValue, &str), ParamError> {
    if let Some(tail) = input.strip_prefix('"') {
        let end = tail
            .find('"')
            .ok_or_else(|| ParamError::MalformedParameter("unterminated string".to_string()))?;
        return Ok((ParamValue::Str(tail[..end].to_string()), &tail[end + 1..]));
    }

    if input.starts_with('(') {
        let (items, after) = parse_inner_list(input)?;
        return Ok((ParamValue::InnerList(items), after));
    }

    let end = input.find(';').unwrap_or(input.len());
    let token = input[..end].trim();
    if token.is_empty() {
        return Err(ParamError::MalformedParameter("empty value".to_string()));
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok((ParamValue::Int(i), &input[end..]));
    }
    // Bare tokens (e.g. unquoted algorithm labels) are tolerated as strings.
    Ok((ParamValue::Str(token.to_string()), &input[end..]))
}

/// Find `needle` outside of double-quoted sections.
fn find_unquoted(haystack: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in haystack.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FULL: &str = "(\"@method\" \"@path\" \"@authority\");created=1700000000;expires=1700000300;nonce=\"n0nce\";keyid=\"kid1\";alg=\"ed25519\"";

    #[test]
    fn parses_full_member() {
        let p = SignatureParams::parse(FULL).unwrap();

        assert_eq!(p.covered.len(), 3);
        assert_eq!(p.covered[0], CoveredComponent::Derived("@method".into()));
        assert_eq!(p.created, 1_700_000_000);
        assert_eq!(p.expires, Some(1_700_000_300));
        assert_eq!(p.nonce.as_deref(), Some("n0nce"));
        assert_eq!(p.keyid, "kid1");
        assert_eq!(p.alg, "ed25519");
        assert_eq!(p.tag, None);
    }

    #[test]
    fn serialization_roundtrips_byte_exact() {
        let p = SignatureParams::parse(FULL).unwrap();
        assert_eq!(p.to_component_value(), FULL);
    }

    #[test]
    fn alg_is_case_insensitive() {
        let member = "(\"@method\");created=1;keyid=\"k\";alg=\"Ed25519\"";
        assert!(SignatureParams::parse(member).is_ok());
    }

    #[test]
    fn rejects_unsupported_alg() {
        let member = "(\"@method\");created=1;keyid=\"k\";alg=\"rsa-pss-sha512\"";
        assert_eq!(
            SignatureParams::parse(member).unwrap_err(),
            ParamError::UnsupportedAlgorithm("rsa-pss-sha512".to_string())
        );
    }

    #[test]
    fn rejects_missing_created() {
        let member = "(\"@method\");keyid=\"k\";alg=\"ed25519\"";
        assert_eq!(
            SignatureParams::parse(member).unwrap_err(),
            ParamError::MissingParameter("created")
        );
    }

    #[test]
    fn rejects_missing_keyid() {
        let member = "(\"@method\");created=1;alg=\"ed25519\"";
        assert_eq!(
            SignatureParams::parse(member).unwrap_err(),
            ParamError::MissingParameter("keyid")
        );
    }

    #[test]
    fn rejects_quoted_created() {
        let member = "(\"@method\");created=\"1\";keyid=\"k\";alg=\"ed25519\"";
        assert_eq!(
            SignatureParams::parse(member).unwrap_err(),
            ParamError::WrongType("created")
        );
    }

    #[test]
    fn rejects_missing_inner_list() {
        assert_eq!(
            SignatureParams::parse("created=1;keyid=\"k\";alg=\"ed25519\"").unwrap_err(),
            ParamError::MissingInnerList
        );
    }

    #[test]
    fn rejects_unterminated_inner_list() {
        assert!(matches!(
            SignatureParams::parse("(\"@method\";created=1").unwrap_err(),
            ParamError::MalformedInnerList(_)
        ));
    }

    #[test]
    fn tag_parameter_is_parsed_and_emitted() {
        let member =
            "(\"@method\");created=1;keyid=\"k\";alg=\"ed25519\";tag=\"web-bot-auth\"";
        let p = SignatureParams::parse(member).unwrap();

        assert_eq!(p.tag.as_deref(), Some("web-bot-auth"));
        assert_eq!(p.to_component_value(), member);
    }

    #[test]
    fn unknown_parameters_are_ignored_structurally() {
        let member = "(\"@method\");created=1;keyid=\"k\";alg=\"ed25519\";ext=42";
        let p = SignatureParams::parse(member).unwrap();
        assert_eq!(p.created, 1);
    }

    #[test]
    fn literal_headers_are_lowercased() {
        let member = "(\"@method\" \"Signature-Agent\");created=1;keyid=\"k\";alg=\"ed25519\"";
        let p = SignatureParams::parse(member).unwrap();
        assert_eq!(
            p.covered[1],
            CoveredComponent::Header("signature-agent".into())
        );
    }

    #[test]
    fn effective_expires_defaults_from_created() {
        let member = "(\"@method\");created=1000;keyid=\"k\";alg=\"ed25519\"";
        let p = SignatureParams::parse(member).unwrap();

        assert_eq!(p.effective_expires(300), 1300);
    }

    #[test]
    fn effective_expires_prefers_explicit_value() {
        let p = SignatureParams::parse(FULL).unwrap();
        assert_eq!(p.effective_expires(300), 1_700_000_300);
    }
}
