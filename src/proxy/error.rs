//! Error types for proxy operations.
//!
//! This module defines structured error types for both proxy modes:
//! - Certificate authority errors (loading, leaf minting)
//! - Listener and TLS setup errors
//! - Connection errors (upstream connection, forwarding)

use thiserror::Error;

/// Errors raised by the local certificate authority.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to create temporary directory for CA files.
    #[error("Failed to create temp directory: {0}")]
    TempDir(#[source] std::io::Error),

    /// Failed to set file permissions.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Failed to generate key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to read CA files.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write certificate or key file.
    #[error("Failed to write file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// CA certificate or key material could not be parsed.
    #[error("Invalid CA material: {0}")]
    InvalidMaterial(String),

    /// The host cannot be put into a certificate.
    #[error("Invalid certificate host '{0}'")]
    InvalidHost(String),

    /// Failed to sign certificate.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),
}

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Request target could not be routed.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate generation failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(#[from] CaError),

    /// Listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Listen address could not be parsed.
    #[error("Invalid listen address '{0}'")]
    InvalidListenAddr(String),

    /// Upstream connection was not established in time.
    #[error("Timed out after {after:?} connecting to upstream '{addr}'")]
    Timeout {
        /// The address we tried to connect to.
        addr: String,
        /// The connect timeout that elapsed.
        after: std::time::Duration,
    },

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Request body could not be read.
    #[error("Failed to read request body: {0}")]
    Body(String),

    /// Signing the outbound request failed.
    #[error("Signing failed: {0}")]
    Sign(#[from] crate::auth::SignError),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
