//! Fetch-on-demand credential lookup against an HTTP key service.
//!
//! A miss issues `GET <base>/<percent-encoded id>`; the service answers
//! with `{"id": "...", "secret": "...", "expires_at": "..."}` (expiry
//! optional). Results are cached for the configured TTL; a 404 is
//! remembered for the shorter negative TTL.

use super::cache::CredentialCache;
use super::{CredentialError, CredentialRecord, CredentialSource, ResolveError};
use crate::proxy::body::empty_body;
use crate::proxy::upstream::{Target, UpstreamConnector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Limited};
use hyper::header::{ACCEPT, HOST};
use hyper::{Request, StatusCode, Uri};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

/// Largest key-service response accepted.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct KeyResponse {
    id: String,
    secret: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Credential source that asks a remote key service on cache miss.
pub struct RemoteCredentialSource {
    base: Uri,
    target: Target,
    connector: UpstreamConnector,
    timeout: Duration,
    cache: CredentialCache,
}

impl RemoteCredentialSource {
    /// Create a source for the key service at `base`.
    pub fn new(
        base: &str,
        connector: UpstreamConnector,
        cache_ttl: Duration,
        negative_ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let invalid = |message: String| CredentialError::InvalidUrl {
            url: base.to_string(),
            message,
        };
        let uri: Uri = base.parse().map_err(|e| invalid(format!("{}", e)))?;
        let target = Target::from_uri(&uri).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            base: uri,
            target,
            connector,
            timeout,
            cache: CredentialCache::new(cache_ttl).with_negative_ttl(negative_ttl),
        })
    }

    fn lookup_path(&self, id: &str) -> String {
        let base = self.base.path().trim_end_matches('/');
        format!("{}/{}", base, urlencoding::encode(id))
    }

    async fn fetch(&self, id: &str) -> Result<CredentialRecord, ResolveError> {
        let lookup = |message: String| ResolveError::Lookup {
            id: id.to_string(),
            message,
        };

        let request = Request::builder()
            .method("GET")
            .uri(self.lookup_path(id))
            .header(HOST, self.target.host_header())
            .header(ACCEPT, "application/json")
            .body(empty_body())
            .map_err(|e| lookup(e.to_string()))?;

        let response = self
            .connector
            .send(&self.target, request)
            .await
            .map_err(|e| lookup(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(ResolveError::NotFound(id.to_string())),
            status => return Err(lookup(format!("key service returned {}", status))),
        }

        let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
            .collect()
            .await
            .map_err(|e| lookup(format!("failed to read response: {}", e)))?
            .to_bytes();
        let parsed: KeyResponse = serde_json::from_slice(&body)
            .map_err(|e| lookup(format!("invalid response: {}", e)))?;

        if parsed.id != id {
            return Err(lookup(format!("key service answered for '{}'", parsed.id)));
        }
        if parsed.secret.is_empty() {
            return Err(lookup("key service returned an empty secret".to_string()));
        }
        Ok(CredentialRecord::new(parsed.id, parsed.secret, parsed.expires_at))
    }
}

#[async_trait]
impl CredentialSource for RemoteCredentialSource {
    fn name(&self) -> &str {
        "remote"
    }

    async fn resolve(&self, id: &str) -> Result<CredentialRecord, ResolveError> {
        if let Some(record) = self.cache.get(id) {
            trace!(key_id = %id, "Credential cache hit");
            return Ok(record);
        }
        if self.cache.is_known_missing(id) {
            trace!(key_id = %id, "Credential known missing");
            return Err(ResolveError::NotFound(id.to_string()));
        }

        debug!(key_id = %id, upstream = %self.target.authority(), "Fetching credential");
        let fetched = tokio::time::timeout(self.timeout, self.fetch(id))
            .await
            .map_err(|_| ResolveError::Lookup {
                id: id.to_string(),
                message: format!("timed out after {:?}", self.timeout),
            })?;
        let record = match fetched {
            Ok(record) => record,
            Err(err @ ResolveError::NotFound(_)) => {
                self.cache.insert_missing(id);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.cache.insert(record.clone());
        Ok(record)
    }

    async fn shutdown(&self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for RemoteCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCredentialSource")
            .field("base", &self.base)
            .field("timeout", &self.timeout)
            .field("cached", &self.cache.len())
            .finish()
    }
}
