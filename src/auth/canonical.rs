//! Canonical request construction.
//!
//! Signer and verifier both reduce a request to the same newline-joined
//! string before computing the MAC, so every rule here has to be
//! deterministic and independent of how the request travelled.

use super::credential::{AUTH_SCHEME, Scope, format_timestamp};
use chrono::{DateTime, Utc};
use hyper::header::{HOST, HeaderMap};
use hyper::{Method, Uri};
use sha2::{Digest, Sha256};

/// Normalized form of a request, ready to be MACed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest(String);

impl CanonicalRequest {
    /// Build the canonical form.
    ///
    /// `signed_headers` must be lower-case and sorted. The `host` line falls
    /// back to the URI authority when the request carries no `Host` header,
    /// which keeps absolute-form proxy requests and origin-form server
    /// requests signing over the same bytes.
    pub fn build(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
        scope: &Scope,
        timestamp: &DateTime<Utc>,
        signed_headers: &[String],
    ) -> Self {
        let mut lines = vec![
            AUTH_SCHEME.to_string(),
            format_timestamp(timestamp),
            scope.to_string(),
            method.as_str().to_ascii_uppercase(),
            canonical_path(uri.path()).to_string(),
            canonical_query(uri.query().unwrap_or("")),
        ];
        for name in signed_headers {
            lines.push(format!("{}:{}", name, header_value(name, uri, headers)));
        }
        lines.push(signed_headers.join(";"));
        lines.push(body_digest(body));
        Self(lines.join("\n"))
    }

    /// Bytes the MAC is computed over.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl AsRef<str> for CanonicalRequest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn header_value(name: &str, uri: &Uri, headers: &HeaderMap) -> String {
    let values: Vec<String> = headers
        .get_all(name)
        .iter()
        .map(|v| collapse_whitespace(&String::from_utf8_lossy(v.as_bytes())))
        .collect();
    if values.is_empty() && name == HOST.as_str() {
        return uri
            .authority()
            .map(|a| a.as_str().to_ascii_lowercase())
            .unwrap_or_default();
    }
    if name == HOST.as_str() {
        return values.join(",").to_ascii_lowercase();
    }
    values.join(",")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The path exactly as sent; an empty path becomes `/`.
///
/// Dot segments and duplicate slashes are kept so that any change to the
/// path after signing changes the MAC input. The verifying side forwards
/// the path it checked, byte for byte.
pub fn canonical_path(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

/// Sort query pairs by key then value, keeping their raw encoding.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Lower-case hex SHA-256 of the body.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
