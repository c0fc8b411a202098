//! TLS plumbing for both proxy modes.
//!
//! This module provides:
//! - The leaf certificate cache used for interception
//! - Dynamic certificate resolution using SNI
//! - The interception acceptor (proxy as server toward the client)
//! - The static-certificate acceptor for the verifying reverse proxy
//! - The upstream connector (proxy as client)
//!
//! # ALPN
//!
//! Intercepted connections force HTTP/1.1 via ALPN. The relay speaks
//! HTTP/1.1 only; letting clients negotiate H2 would break the connection
//! right after the handshake.

use super::ca::CertificateAuthority;
use super::error::{CaError, ProxyError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace, warn};

/// Default lifetime of a cached leaf certificate.
pub const DEFAULT_LEAF_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// How long a minted leaf stays valid past its cache TTL.
const LEAF_VALIDITY_MARGIN: Duration = Duration::from_secs(60 * 60);

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    ca_fingerprint: [u8; 32],
    minted: Instant,
}

/// Leaf certificate cache for TLS interception.
///
/// Keyed by lower-cased host. An entry is only served while it was minted by
/// the current CA and is younger than the TTL; otherwise it is re-minted.
/// Leaves are minted valid for the TTL plus a margin, so a cached leaf is
/// never served after its own `notAfter`.
pub struct LeafCertCache {
    cache: RwLock<HashMap<String, CachedLeaf>>,
    ca: RwLock<Arc<CertificateAuthority>>,
    ttl: Duration,
}

impl LeafCertCache {
    /// Create a cache minting from `ca`.
    pub fn new(ca: Arc<CertificateAuthority>, ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca: RwLock::new(ca),
            ttl,
        }
    }

    /// The CA currently used for minting.
    pub fn ca(&self) -> Arc<CertificateAuthority> {
        self.ca.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Get or mint the certificate for `host`.
    pub fn get_or_generate(&self, host: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let host = host.to_lowercase();
        let ca = self.ca();
        let fingerprint = ca.fingerprint();

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&host)
                && entry.ca_fingerprint == fingerprint
                && entry.minted.elapsed() < self.ttl
            {
                trace!("Certificate cache hit for {}", host);
                return Ok(entry.key.clone());
            }
        }

        debug!("Minting certificate for {}", host);
        let validity = self.ttl.saturating_add(LEAF_VALIDITY_MARGIN);
        let key = Arc::new(certified_key(&ca, &host, validity)?);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent task may have minted first; serve one certificate per host.
        if let Some(entry) = cache.get(&host)
            && entry.ca_fingerprint == fingerprint
            && entry.minted.elapsed() < self.ttl
        {
            return Ok(entry.key.clone());
        }
        cache.insert(
            host,
            CachedLeaf {
                key: key.clone(),
                ca_fingerprint: fingerprint,
                minted: Instant::now(),
            },
        );
        Ok(key)
    }

    /// Swap the CA and drop every certificate minted by the old one.
    pub fn rotate(&self, ca: Arc<CertificateAuthority>) {
        *self.ca.write().unwrap_or_else(PoisonError::into_inner) = ca;
        self.clear();
        debug!("Interception CA rotated");
    }

    /// Clear the certificate cache.
    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached certificates.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn certified_key(
    ca: &CertificateAuthority,
    host: &str,
    validity: Duration,
) -> Result<CertifiedKey, ProxyError> {
    let leaf = ca.generate_cert_valid_for(host, validity)?;

    let mut chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(CaError::Signing("no certificate produced".into()).into());
    }
    for ca_cert in rustls_pemfile::certs(&mut ca.cert_pem().as_bytes()) {
        chain.push(ca_cert.map_err(|e| ProxyError::Tls(format!("Invalid CA PEM: {}", e)))?);
    }

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Certificate resolver that mints certificates on demand.
///
/// Uses SNI from the ClientHello, falling back to the CONNECT host for
/// clients that send no SNI (for example when connecting by IP).
pub struct DynamicCertResolver {
    cache: Arc<LeafCertCache>,
    host_hint: Option<String>,
}

impl DynamicCertResolver {
    /// Create a resolver with an optional fallback host.
    pub fn new(cache: Arc<LeafCertCache>, host_hint: Option<String>) -> Self {
        Self { cache, host_hint }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.host_hint.clone())?;

        match self.cache.get_or_generate(&host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to mint certificate for {}: {}", host, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("host_hint", &self.host_hint)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// Create the acceptor that terminates intercepted client TLS.
pub fn create_intercept_acceptor(
    cache: Arc<LeafCertCache>,
    host_hint: Option<String>,
) -> TlsAcceptor {
    let resolver = Arc::new(DynamicCertResolver::new(cache, host_hint));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Static server TLS for the verifying reverse proxy.
#[derive(Debug, Clone)]
pub struct ServerTlsSettings {
    /// Server certificate chain (PEM).
    pub cert_file: PathBuf,
    /// Server private key (PEM).
    pub key_file: PathBuf,
    /// Bundle used to validate client certificates.
    pub client_ca_file: Option<PathBuf>,
    /// Reject handshakes without a valid client certificate.
    pub require_client_certificate: bool,
}

/// Create the acceptor for a TLS-terminating reverse proxy.
pub fn create_server_acceptor(settings: &ServerTlsSettings) -> Result<TlsAcceptor, ProxyError> {
    let certs = load_certs(&settings.cert_file)?;
    let key = load_private_key(&settings.key_file)?;

    let builder = match &settings.client_ca_file {
        Some(path) => {
            let roots = Arc::new(root_store(&[path.clone()])?);
            let verifier = WebPkiClientVerifier::builder(roots);
            let verifier = if settings.require_client_certificate {
                verifier
            } else {
                verifier.allow_unauthenticated()
            };
            let verifier = verifier
                .build()
                .map_err(|e| ProxyError::Tls(format!("Invalid client CA bundle: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None if settings.require_client_certificate => {
            return Err(ProxyError::Tls(
                "require_client_certificate needs client_ca_file".into(),
            ));
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// How upstream server certificates are checked.
#[derive(Debug, Clone)]
pub enum UpstreamTrust {
    /// System roots plus any extra bundles.
    System {
        /// Additional PEM bundles to trust.
        extra: Vec<PathBuf>,
    },
    /// Only the given bundles.
    Bundle(Vec<PathBuf>),
    /// No verification at all.
    Insecure,
}

/// Create a TLS connector for upstream connections.
pub fn create_tls_connector(trust: &UpstreamTrust) -> Result<TlsConnector, ProxyError> {
    let config = match trust {
        UpstreamTrust::System { extra } => {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in native.errors {
                debug!("Warning loading native cert: {}", err);
            }
            for cert in native.certs {
                if let Err(e) = roots.add(cert) {
                    debug!("Warning adding cert to store: {}", e);
                }
            }
            add_bundles(&mut roots, extra)?;
            if roots.is_empty() {
                warn!("No trusted root certificates found; https upstreams will fail");
            }
            debug!("Loaded {} root certificates", roots.len());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        UpstreamTrust::Bundle(paths) => ClientConfig::builder()
            .with_root_certificates(root_store(paths)?)
            .with_no_client_auth(),
        UpstreamTrust::Insecure => {
            warn!("Upstream certificate verification is disabled");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerification::new()))
                .with_no_client_auth()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn root_store(paths: &[PathBuf]) -> Result<RootCertStore, ProxyError> {
    let mut roots = RootCertStore::empty();
    add_bundles(&mut roots, paths)?;
    if roots.is_empty() {
        return Err(ProxyError::Tls("trust bundle contains no certificates".into()));
    }
    Ok(roots)
}

fn add_bundles(roots: &mut RootCertStore, paths: &[PathBuf]) -> Result<(), ProxyError> {
    for path in paths {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ProxyError::Tls(format!("Invalid certificate in {:?}: {}", path, e)))?;
        }
    }
    Ok(())
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to read {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("No certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let pem = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to read {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ProxyError::Tls(format!("Failed to parse {:?}: {}", path, e)))?
        .ok_or_else(|| ProxyError::Tls(format!("No private key found in {:?}", path)))
}

/// Convert a host string to a ServerName for TLS connection.
pub fn host_to_server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))
}

/// Accepts any upstream certificate. Only used with `insecure_skip_verify`.
#[derive(Debug)]
struct NoCertVerification(Arc<rustls::crypto::CryptoProvider>);

impl NoCertVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
