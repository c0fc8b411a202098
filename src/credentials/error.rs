//! Error types for credential sources.

use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a failed key lookup.
///
/// The verifier treats both variants as an unknown key; the split exists so
/// operators can tell a missing key from a broken lookup backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The source has no record for the key.
    #[error("no credential for key '{0}'")]
    NotFound(String),

    /// The lookup itself failed (network, timeout, bad response).
    #[error("credential lookup for key '{id}' failed: {message}")]
    Lookup {
        /// Key that was being resolved.
        id: String,
        /// What went wrong.
        message: String,
    },
}

/// Errors raised while constructing a credential source.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Two static entries share an id.
    #[error("Duplicate credential id '{0}'")]
    DuplicateId(String),

    /// A static entry is unusable.
    #[error("Invalid credential '{id}': {message}")]
    InvalidRecord {
        /// Offending key id.
        id: String,
        /// Description of the problem.
        message: String,
    },

    /// A secret file could not be read.
    #[error("Failed to read secret file {path}: {source}")]
    SecretFile {
        /// Path to the secret file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The remote lookup URL is unusable.
    #[error("Invalid credential source URL '{url}': {message}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// Description of the problem.
        message: String,
    },

    /// TLS setup for the remote source failed.
    #[error("Credential source TLS setup failed: {0}")]
    Tls(#[from] crate::proxy::error::ProxyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::NotFound("k1".to_string());
        assert!(err.to_string().contains("k1"));

        let err = ResolveError::Lookup {
            id: "k2".to_string(),
            message: "timed out".to_string(),
        };
        assert!(err.to_string().contains("k2"));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_duplicate_id_display() {
        let err = CredentialError::DuplicateId("k1".to_string());
        assert_eq!(err.to_string(), "Duplicate credential id 'k1'");
    }
}
