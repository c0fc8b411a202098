//! Credential sources: resolve a key id to its verification secret.
//!
//! Two implementations exist:
//! - [`StaticCredentialSource`]: a table loaded once from configuration
//! - [`RemoteCredentialSource`]: a key service queried on cache miss
//!
//! Both are used through the [`CredentialSource`] trait so the verifier
//! does not care where keys come from.

pub mod cache;
pub mod error;
pub mod remote;
pub mod static_table;

pub use cache::CredentialCache;
pub use error::{CredentialError, ResolveError};
pub use remote::RemoteCredentialSource;
pub use static_table::StaticCredentialSource;

use crate::auth::key::{strip_trailing_newline, validate_key_id};
use crate::config::{CredentialSourceConfig, StaticKeyConfig};
use crate::proxy::tls::{UpstreamTrust, create_tls_connector};
use crate::proxy::upstream::UpstreamConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Verification material for one key.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    id: String,
    secret: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Create a record.
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            expires_at,
        }
    }

    /// Key identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shared secret.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// When the record stops being valid, if ever.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resolves key identifiers to credential records.
///
/// Implementations are shared across every request task of an instance and
/// must tolerate concurrent `resolve` calls.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Look up the record for `id`.
    async fn resolve(&self, id: &str) -> Result<CredentialRecord, ResolveError>;

    /// Release resources when the owning instance stops.
    async fn shutdown(&self) {}
}

/// Build the credential source described by `config`.
pub fn from_config(
    config: &CredentialSourceConfig,
) -> Result<Arc<dyn CredentialSource>, CredentialError> {
    match config {
        CredentialSourceConfig::Static(cfg) => {
            let records = cfg
                .keys
                .iter()
                .map(load_static_key)
                .collect::<Result<Vec<_>, _>>()?;
            let source = StaticCredentialSource::new(records)?;
            info!(keys = source.len(), "Loaded static credential table");
            Ok(Arc::new(source))
        }
        CredentialSourceConfig::Remote(cfg) => {
            let trust = UpstreamTrust::System {
                extra: cfg.ca_file.iter().cloned().collect(),
            };
            let connector = UpstreamConnector::new(create_tls_connector(&trust)?);
            let source = RemoteCredentialSource::new(
                &cfg.url,
                connector,
                Duration::from_secs(cfg.cache_ttl_secs),
                Duration::from_secs(cfg.negative_ttl_secs),
                Duration::from_secs(cfg.timeout_secs),
            )?;
            info!(url = %cfg.url, "Using remote credential source");
            Ok(Arc::new(source))
        }
    }
}

fn load_static_key(key: &StaticKeyConfig) -> Result<CredentialRecord, CredentialError> {
    let invalid = |message: String| CredentialError::InvalidRecord {
        id: key.id.clone(),
        message,
    };
    validate_key_id(&key.id).map_err(invalid)?;

    let secret = match (&key.secret, &key.secret_file) {
        (Some(secret), None) => secret.as_bytes().to_vec(),
        (None, Some(path)) => {
            let mut bytes = std::fs::read(path).map_err(|source| CredentialError::SecretFile {
                path: path.clone(),
                source,
            })?;
            strip_trailing_newline(&mut bytes);
            bytes
        }
        (Some(_), Some(_)) => {
            return Err(invalid("set either secret or secret_file, not both".to_string()));
        }
        (None, None) => return Err(invalid("missing secret or secret_file".to_string())),
    };
    if secret.is_empty() {
        return Err(invalid("empty secret".to_string()));
    }

    Ok(CredentialRecord::new(key.id.clone(), secret, key.expires_at))
}
