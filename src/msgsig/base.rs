//! Canonical signature base construction.
//!
//! The base is a sequence of lines `"<component>": <value>\n`, one per
//! covered component in list order, terminated by a `"@signature-params"`
//! line carrying the inner list plus parameters exactly as they appear in
//! `Signature-Input`. The final line has no trailing newline.

use thiserror::Error;

use super::params::CoveredComponent;

/// Derived component names this implementation resolves.
pub const SUPPORTED_DERIVED: [&str; 7] = [
    "@method",
    "@authority",
    "@path",
    "@query",
    "@target-uri",
    "@scheme",
    "@request-target",
];

/// Errors from base construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BaseError {
    /// A covered component is not present on the request.
    #[error("covered component not present: {0}")]
    MissingComponent(String),

    /// A derived component outside the supported set was covered.
    #[error("unknown derived component: {0}")]
    UnknownDerivedComponent(String),

    /// A header value could not be interpreted.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

/// The request material the base is built from.
///
/// `path` is the request path exactly as sent (percent-encoding preserved);
/// `query` excludes the leading `?`. Header names are matched
/// case-insensitively; repeated headers keep their order of appearance.
#[derive(Debug, Clone)]
pub struct RequestComponents {
    /// Request method, any case.
    pub method: String,
    /// URI scheme (`http` or `https`).
    pub scheme: String,
    /// Host with optional port, as sent.
    pub authority: String,
    /// Request path as sent.
    pub path: String,
    /// Query string without the leading `?`, when present.
    pub query: Option<String>,
    /// Header fields in order of appearance.
    pub headers: Vec<(String, String)>,
}

impl RequestComponents {
    /// Resolve a derived component to its canonical value.
    fn derived(&self, name: &str) -> Result<String, BaseError> {
        match name {
            "@method" => Ok(self.method.to_ascii_uppercase()),
            "@authority" => Ok(canonical_authority(&self.authority, &self.scheme)),
            "@path" => Ok(self.path.clone()),
            "@query" => Ok(self
                .query
                .as_ref()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()),
            "@scheme" => Ok(self.scheme.to_ascii_lowercase()),
            "@target-uri" => Ok(format!(
                "{}://{}{}",
                self.scheme.to_ascii_lowercase(),
                canonical_authority(&self.authority, &self.scheme),
                self.request_target(),
            )),
            "@request-target" => Ok(self.request_target()),
            other => Err(BaseError::UnknownDerivedComponent(other.to_string())),
        }
    }

    fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// Resolve a literal header: values of all occurrences in order, each
    /// OWS-trimmed, joined with comma-space.
    fn header(&self, name: &str) -> Result<String, BaseError> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim_matches([' ', '\t']))
            .collect();

        if values.is_empty() {
            return Err(BaseError::MissingComponent(name.to_string()));
        }
        for v in &values {
            if v.contains(['\r', '\n']) {
                return Err(BaseError::MalformedHeader(name.to_string()));
            }
        }
        Ok(values.join(", "))
    }
}

/// Canonical `@authority`: lowercase host, default port stripped.
fn canonical_authority(authority: &str, scheme: &str) -> String {
    let lower = authority.to_ascii_lowercase();
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "http" => ":80",
        "https" => ":443",
        _ => return lower,
    };
    match lower.strip_suffix(default_port) {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

/// Build the signature base over `covered` components, terminated by the
/// `"@signature-params"` line carrying `params_value` verbatim.
pub fn build_signature_base(
    request: &RequestComponents,
    covered: &[CoveredComponent],
    params_value: &str,
) -> Result<String, BaseError> {
    let mut base = String::new();
    for component in covered {
        let value = match component {
            CoveredComponent::Derived(name) => request.derived(name)?,
            CoveredComponent::Header(name) => request.header(name)?,
        };
        base.push_str(&format!("\"{}\": {value}\n", component.name()));
    }
    base.push_str(&format!("\"@signature-params\": {params_value}"));
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn covered(names: &[&str]) -> Vec<CoveredComponent> {
        names.iter().map(|n| CoveredComponent::parse(n)).collect()
    }

    fn request() -> RequestComponents {
        RequestComponents {
            method: "get".to_string(),
            scheme: "https".to_string(),
            authority: "Example.COM".to_string(),
            path: "/post/1".to_string(),
            query: None,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }

    #[test]
    fn known_answer_base_string() {
        // Exact expected output for the default covered set.
        let req = RequestComponents {
            method: "POST".to_string(),
            scheme: "https".to_string(),
            authority: "example.com".to_string(),
            path: "/x?y=1".to_string(),
            query: None,
            headers: vec![],
        };
        let params = "(\"@method\" \"@authority\" \"@path\");created=1700000000;keyid=\"k1\";alg=\"ed25519\"";
        let base = build_signature_base(
            &req,
            &covered(&["@method", "@authority", "@path"]),
            params,
        )
        .unwrap();

        assert_eq!(
            base,
            format!(
                "\"@method\": POST\n\"@authority\": example.com\n\"@path\": /x?y=1\n\"@signature-params\": {params}"
            )
        );
    }

    #[test]
    fn base_has_no_trailing_newline() {
        let base =
            build_signature_base(&request(), &covered(&["@method"]), "(\"@method\");x=1").unwrap();
        assert!(!base.ends_with('\n'));
    }

    #[test]
    fn method_is_uppercased() {
        let base =
            build_signature_base(&request(), &covered(&["@method"]), "p").unwrap();
        assert!(base.starts_with("\"@method\": GET\n"));
    }

    #[test]
    fn authority_is_lowercased_and_default_port_stripped() {
        let mut req = request();
        req.authority = "Example.COM:443".to_string();
        let base = build_signature_base(&req, &covered(&["@authority"]), "p").unwrap();
        assert!(base.starts_with("\"@authority\": example.com\n"));
    }

    #[test]
    fn non_default_port_is_preserved() {
        let mut req = request();
        req.authority = "example.com:8443".to_string();
        let base = build_signature_base(&req, &covered(&["@authority"]), "p").unwrap();
        assert!(base.starts_with("\"@authority\": example.com:8443\n"));
    }

    #[test]
    fn http_port_80_is_stripped() {
        let mut req = request();
        req.scheme = "http".to_string();
        req.authority = "example.com:80".to_string();
        let base = build_signature_base(&req, &covered(&["@authority"]), "p").unwrap();
        assert!(base.starts_with("\"@authority\": example.com\n"));
    }

    #[test]
    fn query_includes_leading_question_mark() {
        let mut req = request();
        req.query = Some("a=1&b=2".to_string());
        let base = build_signature_base(&req, &covered(&["@query"]), "p").unwrap();
        assert!(base.starts_with("\"@query\": ?a=1&b=2\n"));
    }

    #[test]
    fn absent_query_is_empty_string() {
        let base = build_signature_base(&request(), &covered(&["@query"]), "p").unwrap();
        assert!(base.starts_with("\"@query\": \n"));
    }

    #[test]
    fn target_uri_combines_scheme_authority_path_query() {
        let mut req = request();
        req.query = Some("y=1".to_string());
        let base = build_signature_base(&req, &covered(&["@target-uri"]), "p").unwrap();
        assert!(base.starts_with("\"@target-uri\": https://example.com/post/1?y=1\n"));
    }

    #[test]
    fn request_target_is_origin_form() {
        let mut req = request();
        req.query = Some("y=1".to_string());
        let base = build_signature_base(&req, &covered(&["@request-target"]), "p").unwrap();
        assert!(base.starts_with("\"@request-target\": /post/1?y=1\n"));
    }

    #[test]
    fn literal_header_is_matched_case_insensitively() {
        let base = build_signature_base(&request(), &covered(&["content-type"]), "p").unwrap();
        assert!(base.starts_with("\"content-type\": application/json\n"));
    }

    #[test]
    fn repeated_headers_join_comma_space_with_ows_trim() {
        let mut req = request();
        req.headers = vec![
            ("X-Forwarded-For".to_string(), " 10.0.0.1 ".to_string()),
            ("x-forwarded-for".to_string(), "\t10.0.0.2".to_string()),
        ];
        let base = build_signature_base(&req, &covered(&["x-forwarded-for"]), "p").unwrap();
        assert!(base.starts_with("\"x-forwarded-for\": 10.0.0.1, 10.0.0.2\n"));
    }

    #[test]
    fn missing_header_is_missing_component() {
        assert_eq!(
            build_signature_base(&request(), &covered(&["x-absent"]), "p").unwrap_err(),
            BaseError::MissingComponent("x-absent".to_string())
        );
    }

    #[test]
    fn unknown_derived_component_is_rejected() {
        assert_eq!(
            build_signature_base(&request(), &covered(&["@status"]), "p").unwrap_err(),
            BaseError::UnknownDerivedComponent("@status".to_string())
        );
    }

    #[test]
    fn header_with_embedded_newline_is_malformed() {
        let mut req = request();
        req.headers = vec![("x-bad".to_string(), "a\r\nb".to_string())];
        assert_eq!(
            build_signature_base(&req, &covered(&["x-bad"]), "p").unwrap_err(),
            BaseError::MalformedHeader("x-bad".to_string())
        );
    }

    #[test]
    fn identical_base_for_different_bodies() {
        // The body is never a component, so two requests that differ only in
        // body produce the same base.
        let params = "(\"@method\" \"@authority\" \"@path\");created=1;keyid=\"k\";alg=\"ed25519\"";
        let sel = covered(&["@method", "@authority", "@path"]);
        let a = build_signature_base(&request(), &sel, params).unwrap();
        let b = build_signature_base(&request(), &sel, params).unwrap();
        assert_eq!(a, b);
    }
}
