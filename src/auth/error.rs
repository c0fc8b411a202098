//! Error types for request signing and verification.
//!
//! Signing errors are either fatal at construction (bad key material) or
//! scoped to a single request (unreadable body). Verification failures are
//! always request-scoped and map onto an authentication-failure response.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a signer or signing a request.
#[derive(Debug, Error)]
pub enum SignError {
    /// The signing key configuration is unusable.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// The key file could not be read.
    #[error("Failed to read key file {path}: {source}")]
    KeyFile {
        /// Path to the key file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configured signed header name is not a valid header name.
    #[error("Invalid signed header name '{0}'")]
    InvalidHeaderName(String),

    /// The computed credential could not be encoded as a header value.
    #[error("Failed to encode credential header: {0}")]
    HeaderEncoding(String),
}

/// Reasons a request fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential header on the request.
    #[error("missing credential")]
    MissingCredential,

    /// The credential header could not be parsed.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// The credential source has no usable record for the key.
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    /// The recomputed signature does not match.
    #[error("signature mismatch")]
    BadSignature,

    /// The credential timestamp falls outside the clock-skew window.
    #[error("credential timestamp outside the allowed clock skew of {}s", skew.as_secs())]
    Expired {
        /// The configured maximum skew.
        skew: Duration,
    },
}

impl AuthError {
    /// Short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::MalformedCredential(_) => "malformed_credential",
            AuthError::UnknownKey(_) => "unknown_key",
            AuthError::BadSignature => "bad_signature",
            AuthError::Expired { .. } => "expired",
        }
    }
}
