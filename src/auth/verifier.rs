//! Inbound request verification.

use super::canonical::CanonicalRequest;
use super::credential::{CREDENTIAL_HEADER, SignatureCredential};
use super::error::AuthError;
use crate::credentials::{CredentialSource, ResolveError};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use hyper::Request;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between a credential timestamp and the local clock.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Checks signature credentials against a credential source.
///
/// Checks run in a fixed order: presence, syntax, key lookup, signature,
/// freshness. The signature is compared before the timestamp so a stale
/// but authentic request reports `Expired` while a forged one reports
/// `BadSignature` regardless of its timestamp.
pub struct Verifier {
    source: Arc<dyn CredentialSource>,
    max_clock_skew: Duration,
}

impl Verifier {
    /// Create a verifier backed by `source`.
    pub fn new(source: Arc<dyn CredentialSource>, max_clock_skew: Duration) -> Self {
        Self {
            source,
            max_clock_skew,
        }
    }

    /// Configured clock-skew tolerance.
    pub fn max_clock_skew(&self) -> Duration {
        self.max_clock_skew
    }

    /// Verify a buffered request against the current time.
    pub async fn verify(&self, request: &Request<Bytes>) -> Result<SignatureCredential, AuthError> {
        self.verify_at(request, Utc::now()).await
    }

    /// Verify a buffered request as of `now`.
    pub async fn verify_at(
        &self,
        request: &Request<Bytes>,
        now: DateTime<Utc>,
    ) -> Result<SignatureCredential, AuthError> {
        let mut values = request.headers().get_all(&CREDENTIAL_HEADER).iter();
        let value = values.next().ok_or(AuthError::MissingCredential)?;
        if values.next().is_some() {
            return Err(AuthError::MalformedCredential(
                "multiple credential headers".to_string(),
            ));
        }
        let value = value.to_str().map_err(|_| {
            AuthError::MalformedCredential("credential header is not ASCII".to_string())
        })?;
        let credential = SignatureCredential::parse(value)?;
        let key_id = &credential.scope.key_id;

        let record = match self.source.resolve(key_id).await {
            Ok(record) if record.is_expired(now) => {
                debug!(key_id = %key_id, "Credential record expired");
                return Err(AuthError::UnknownKey(key_id.clone()));
            }
            Ok(record) => record,
            Err(ResolveError::NotFound(_)) => {
                return Err(AuthError::UnknownKey(key_id.clone()));
            }
            Err(err @ ResolveError::Lookup { .. }) => {
                warn!(source = self.source.name(), error = %err, "Credential lookup failed");
                return Err(AuthError::UnknownKey(key_id.clone()));
            }
        };

        let canonical = CanonicalRequest::build(
            request.method(),
            request.uri(),
            request.headers(),
            request.body(),
            &credential.scope,
            &credential.timestamp,
            &credential.signed_headers,
        );
        let mut mac = HmacSha256::new_from_slice(record.secret())
            .map_err(|_| AuthError::UnknownKey(key_id.clone()))?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&credential.signature)
            .map_err(|_| AuthError::BadSignature)?;

        let skew = TimeDelta::from_std(self.max_clock_skew).unwrap_or(TimeDelta::MAX);
        let drift = (now - credential.timestamp).abs();
        if drift > skew {
            return Err(AuthError::Expired {
                skew: self.max_clock_skew,
            });
        }

        Ok(credential)
    }

    /// Release verifier resources at instance shutdown.
    pub async fn stop(&self) {
        self.source.shutdown().await;
        debug!(source = self.source.name(), "Verifier stopped");
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("source", &self.source.name())
            .field("max_clock_skew", &self.max_clock_skew)
            .finish()
    }
}
