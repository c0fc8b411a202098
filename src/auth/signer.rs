//! Outbound request signing.

use super::canonical::CanonicalRequest;
use super::credential::{CREDENTIAL_HEADER, SignatureCredential};
use super::error::SignError;
use super::key::SigningKey;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use hyper::Request;
use hyper::header::{HOST, HeaderName, HeaderValue};
use sha2::Sha256;
use tracing::{debug, trace};

type HmacSha256 = Hmac<Sha256>;

/// Attaches a signature credential to outbound requests.
///
/// Holds only its key and the list of headers it signs; every call is
/// independent, so one signer is shared by all connections of an instance.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    signed_headers: Vec<String>,
}

impl Signer {
    /// Create a signer that signs `host` plus each of `extra_headers` that is
    /// present on a request.
    pub fn new(key: SigningKey, extra_headers: &[String]) -> Result<Self, SignError> {
        let mut signed_headers = vec![HOST.as_str().to_string()];
        for name in extra_headers {
            let header = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| SignError::InvalidHeaderName(name.clone()))?;
            if header == CREDENTIAL_HEADER {
                return Err(SignError::InvalidHeaderName(name.clone()));
            }
            signed_headers.push(header.as_str().to_string());
        }
        signed_headers.sort();
        signed_headers.dedup();

        debug!(key_id = %key.id(), headers = ?signed_headers, "Signer ready");
        Ok(Self {
            key,
            signed_headers,
        })
    }

    /// Identifier of the signing key.
    pub fn key_id(&self) -> &str {
        self.key.id()
    }

    /// The signing key.
    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Sign a fully buffered request with the current time.
    pub fn sign(&self, request: &mut Request<Bytes>) -> Result<SignatureCredential, SignError> {
        self.sign_at(request, Utc::now())
    }

    /// Sign a fully buffered request as of `now`.
    ///
    /// Any credential header already on the request is replaced.
    pub fn sign_at(
        &self,
        request: &mut Request<Bytes>,
        now: DateTime<Utc>,
    ) -> Result<SignatureCredential, SignError> {
        request.headers_mut().remove(&CREDENTIAL_HEADER);

        let timestamp = now.trunc_subsecs(6);
        let signed_headers: Vec<String> = self
            .signed_headers
            .iter()
            .filter(|name| name.as_str() == HOST.as_str() || request.headers().contains_key(name.as_str()))
            .cloned()
            .collect();
        let scope = self.key.scope();

        let canonical = CanonicalRequest::build(
            request.method(),
            request.uri(),
            request.headers(),
            request.body(),
            &scope,
            &timestamp,
            &signed_headers,
        );
        trace!(canonical = canonical.as_ref(), "Canonical request");

        let mut mac = HmacSha256::new_from_slice(self.key.secret())
            .map_err(|e| SignError::InvalidKey(e.to_string()))?;
        mac.update(canonical.as_bytes());
        let signature = mac.finalize().into_bytes().to_vec();

        let credential = SignatureCredential {
            scope,
            timestamp,
            signed_headers,
            signature,
        };
        let value = HeaderValue::from_str(&credential.to_header_value())
            .map_err(|e| SignError::HeaderEncoding(e.to_string()))?;
        request.headers_mut().insert(CREDENTIAL_HEADER.clone(), value);

        debug!(
            key_id = %self.key.id(),
            method = %request.method(),
            uri = %request.uri(),
            "Signed request"
        );
        Ok(credential)
    }

    /// Release signer resources at instance shutdown.
    pub fn stop(&self) {
        debug!(key_id = %self.key.id(), "Signer stopped");
    }
}
