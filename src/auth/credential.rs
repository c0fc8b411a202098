//! The signature credential carried on signed requests.
//!
//! Wire format of the `X-Hmac-Authorization` header:
//!
//! ```text
//! HMAC-SHA256 Credential=k1/us-east-1/widgets, Timestamp=20261019T120000.000000Z, SignedHeaders=content-type;host, Signature=5d41...
//! ```
//!
//! Region and service may be empty (`Credential=k1//`).

use super::error::AuthError;
use chrono::{DateTime, NaiveDateTime, Utc};
use hyper::header::HeaderName;
use std::fmt;

/// Header that carries the credential.
pub static CREDENTIAL_HEADER: HeaderName = HeaderName::from_static("x-hmac-authorization");

/// Authentication scheme / algorithm label.
pub const AUTH_SCHEME: &str = "HMAC-SHA256";

/// Timestamp layout used on the wire and in the canonical request.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

const TIMESTAMP_PARSE_FORMAT: &str = "%Y%m%dT%H%M%S%.fZ";

/// Key identifier plus the scope fields it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Key identifier.
    pub key_id: String,
    /// Region scope field (may be empty).
    pub region: String,
    /// Service scope field (may be empty).
    pub service: String,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.key_id, self.region, self.service)
    }
}

/// A parsed or freshly produced signature credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCredential {
    /// Key and scope the signature was produced under.
    pub scope: Scope,
    /// Signing time, microsecond precision.
    pub timestamp: DateTime<Utc>,
    /// Lower-case names of the signed headers, sorted.
    pub signed_headers: Vec<String>,
    /// Raw MAC bytes.
    pub signature: Vec<u8>,
}

impl SignatureCredential {
    /// Render the header value.
    pub fn to_header_value(&self) -> String {
        format!(
            "{} Credential={}, Timestamp={}, SignedHeaders={}, Signature={}",
            AUTH_SCHEME,
            self.scope,
            format_timestamp(&self.timestamp),
            self.signed_headers.join(";"),
            hex::encode(&self.signature)
        )
    }

    /// Parse a header value.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        let (scheme, params) = value
            .split_once(' ')
            .ok_or_else(|| malformed("missing credential parameters"))?;
        if !scheme.eq_ignore_ascii_case(AUTH_SCHEME) {
            return Err(malformed(format!("unsupported scheme '{}'", scheme)));
        }

        let mut credential = None;
        let mut timestamp = None;
        let mut signed_headers = None;
        let mut signature = None;

        for part in params.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| malformed(format!("parameter '{}' has no value", part)))?;
            let slot = match name.trim() {
                "Credential" => &mut credential,
                "Timestamp" => &mut timestamp,
                "SignedHeaders" => &mut signed_headers,
                "Signature" => &mut signature,
                other => return Err(malformed(format!("unknown parameter '{}'", other))),
            };
            if slot.replace(value.trim()).is_some() {
                return Err(malformed(format!("duplicate parameter '{}'", name.trim())));
            }
        }

        let scope = parse_scope(credential.ok_or_else(|| malformed("missing Credential"))?)?;
        let timestamp =
            parse_timestamp(timestamp.ok_or_else(|| malformed("missing Timestamp"))?)?;
        let signed_headers =
            parse_signed_headers(signed_headers.ok_or_else(|| malformed("missing SignedHeaders"))?)?;
        let signature = hex::decode(signature.ok_or_else(|| malformed("missing Signature"))?)
            .map_err(|e| malformed(format!("signature is not hex: {}", e)))?;
        if signature.is_empty() {
            return Err(malformed("empty signature"));
        }

        Ok(Self {
            scope,
            timestamp,
            signed_headers,
            signature,
        })
    }
}

/// Format a timestamp the way it travels on the wire.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AuthError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_PARSE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| malformed(format!("invalid timestamp '{}': {}", value, e)))
}

fn parse_scope(value: &str) -> Result<Scope, AuthError> {
    let mut parts = value.splitn(3, '/');
    let key_id = parts.next().unwrap_or_default();
    let (Some(region), Some(service)) = (parts.next(), parts.next()) else {
        return Err(malformed(format!(
            "credential scope '{}' is not <id>/<region>/<service>",
            value
        )));
    };
    if key_id.is_empty() {
        return Err(malformed("empty key id"));
    }
    if service.contains('/') {
        return Err(malformed(format!("credential scope '{}' has extra segments", value)));
    }
    Ok(Scope {
        key_id: key_id.to_string(),
        region: region.to_string(),
        service: service.to_string(),
    })
}

fn parse_signed_headers(value: &str) -> Result<Vec<String>, AuthError> {
    let mut names: Vec<String> = value
        .split(';')
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    if names.iter().any(String::is_empty) {
        return Err(malformed("empty signed header name"));
    }
    names.sort();
    names.dedup();
    if !names.iter().any(|name| name == "host") {
        return Err(malformed("host is not a signed header"));
    }
    Ok(names)
}

fn malformed(reason: impl Into<String>) -> AuthError {
    AuthError::MalformedCredential(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> SignatureCredential {
        SignatureCredential {
            scope: Scope {
                key_id: "k1".to_string(),
                region: "us-east-1".to_string(),
                service: "widgets".to_string(),
            },
            timestamp: Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
                + chrono::TimeDelta::microseconds(123_456),
            signed_headers: vec!["content-type".to_string(), "host".to_string()],
            signature: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn test_header_value_layout() {
        let value = sample().to_header_value();
        assert_eq!(
            value,
            "HMAC-SHA256 Credential=k1/us-east-1/widgets, Timestamp=20261019T120000.123456Z, \
             SignedHeaders=content-type;host, Signature=deadbeef"
        );
    }

    #[test]
    fn test_parse_preserves_microseconds() {
        let credential = sample();
        let parsed = SignatureCredential::parse(&credential.to_header_value()).unwrap();
        assert_eq!(parsed.timestamp, credential.timestamp);
        assert_eq!(parsed.scope, credential.scope);
    }

    #[test]
    fn test_parse_empty_scope_fields() {
        let parsed = SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, Timestamp=20261019T120000.000000Z, SignedHeaders=host, Signature=00",
        )
        .unwrap();
        assert_eq!(parsed.scope.key_id, "k1");
        assert!(parsed.scope.region.is_empty());
        assert!(parsed.scope.service.is_empty());
    }

    #[test]
    fn test_parse_rejects_other_scheme() {
        let result = SignatureCredential::parse("Bearer abc");
        assert!(matches!(result, Err(AuthError::MalformedCredential(_))));
    }

    #[test]
    fn test_parse_rejects_missing_parameters() {
        let result = SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, SignedHeaders=host, Signature=00",
        );
        assert!(matches!(result, Err(AuthError::MalformedCredential(m)) if m.contains("Timestamp")));
    }

    #[test]
    fn test_parse_rejects_unsigned_host() {
        let result = SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, Timestamp=20261019T120000.000000Z, SignedHeaders=content-type, Signature=00",
        );
        assert!(matches!(result, Err(AuthError::MalformedCredential(m)) if m.contains("host")));
    }

    #[test]
    fn test_parse_rejects_bad_hex_and_timestamp() {
        assert!(SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, Timestamp=20261019T120000.000000Z, SignedHeaders=host, Signature=zz",
        )
        .is_err());
        assert!(SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, Timestamp=yesterday, SignedHeaders=host, Signature=00",
        )
        .is_err());
    }

    #[test]
    fn test_parse_rejects_duplicate_parameter() {
        let result = SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1//, Credential=k2//, Timestamp=20261019T120000.000000Z, SignedHeaders=host, Signature=00",
        );
        assert!(matches!(result, Err(AuthError::MalformedCredential(m)) if m.contains("duplicate")));
    }

    #[test]
    fn test_parse_rejects_short_scope() {
        let result = SignatureCredential::parse(
            "HMAC-SHA256 Credential=k1, Timestamp=20261019T120000.000000Z, SignedHeaders=host, Signature=00",
        );
        assert!(result.is_err());
    }
}
