//! Local certificate authority for TLS interception.
//!
//! The forward proxy presents leaf certificates minted by this CA. The CA is
//! either loaded from PEM files supplied by the operator or generated fresh
//! at startup. A generated CA lives in a private temp directory:
//!
//! - directory is 0700, private key is 0600
//! - everything is removed when the `CertificateAuthority` is dropped
//! - the CA certificate is valid for ten years
//!
//! Leaves are never valid past the CA's own `notAfter`.
//!
//! Clients must trust [`CertificateAuthority::cert_path`] for interception
//! to succeed.

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Validity period of a generated CA.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Default validity of a minted leaf.
pub const DEFAULT_LEAF_VALIDITY: std::time::Duration =
    std::time::Duration::from_secs(24 * 60 * 60);

/// CA key pair and certificate used to sign leaf certificates.
pub struct CertificateAuthority {
    /// Temp directory holding generated material; `None` for loaded CAs.
    _temp_dir: Option<TempDir>,
    cert_path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    fingerprint: [u8; 32],
    not_after: OffsetDateTime,
}

/// Certificate minted for a single host.
pub struct DomainCertificate {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh ECDSA P-384 CA in a private temp directory.
    pub fn generate() -> Result<Self, CaError> {
        info!("Generating ephemeral CA certificate");

        let temp_dir = tempfile::Builder::new()
            .prefix("hmac-proxy-ca-")
            .tempdir()
            .map_err(CaError::TempDir)?;
        fs::set_permissions(temp_dir.path(), fs::Permissions::from_mode(0o700))
            .map_err(CaError::Permissions)?;

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("hmac-proxy Interception CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("hmac-proxy".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        let not_after = params.not_after;

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;
        let cert_pem = cert.pem();

        let cert_path = temp_dir.path().join("ca.crt");
        fs::write(&cert_path, &cert_pem).map_err(CaError::WriteFile)?;
        write_restricted_file(&temp_dir.path().join("ca.key"), &key_pair.serialize_pem())?;

        debug!("Ephemeral CA written to {:?}", temp_dir.path());

        Ok(Self {
            _temp_dir: Some(temp_dir),
            cert_path,
            fingerprint: Sha256::digest(cert.der()).into(),
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            not_after,
        })
    }

    /// Load an operator-supplied CA from PEM files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| CaError::ReadFile {
                path: path.to_path_buf(),
                source,
            })
        };
        let mut ca = Self::from_pem(&read(cert_path)?, &read(key_path)?)?;
        ca.cert_path = cert_path.to_path_buf();
        info!("Loaded CA certificate from {:?}", cert_path);
        Ok(ca)
    }

    /// Build a CA from PEM strings.
    ///
    /// The certificate must carry `BasicConstraints` with `cA` set.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::InvalidMaterial("no certificate in PEM".to_string()))?
            .map_err(|e| CaError::InvalidMaterial(e.to_string()))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| CaError::InvalidMaterial(e.to_string()))?;
        let is_ca = parsed
            .basic_constraints()
            .map_err(|e| CaError::InvalidMaterial(e.to_string()))?
            .is_some_and(|ext| ext.value.ca);
        if !is_ca {
            return Err(CaError::InvalidMaterial(
                "certificate is not a CA certificate".to_string(),
            ));
        }
        let not_after =
            OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
                .map_err(|e| CaError::InvalidMaterial(e.to_string()))?;

        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaError::InvalidMaterial(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::InvalidMaterial(e.to_string()))?;

        Ok(Self {
            _temp_dir: None,
            cert_path: PathBuf::new(),
            fingerprint: Sha256::digest(der.as_ref()).into(),
            issuer,
            cert_pem: cert_pem.to_string(),
            not_after,
        })
    }

    /// Path to the CA certificate clients should trust.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// CA certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// SHA-256 of the CA certificate DER. Identifies the CA for cache
    /// invalidation.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// End of the CA certificate's validity.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Mint a leaf certificate for `host` valid for [`DEFAULT_LEAF_VALIDITY`].
    pub fn generate_cert(&self, host: &str) -> Result<DomainCertificate, CaError> {
        self.generate_cert_valid_for(host, DEFAULT_LEAF_VALIDITY)
    }

    /// Mint a leaf certificate for `host`, signed by this CA.
    ///
    /// `host` may be a DNS name or an IP address literal (IPv6 with or
    /// without brackets). The leaf expires after `validity` or with the CA,
    /// whichever comes first.
    pub fn generate_cert_valid_for(
        &self,
        host: &str,
        validity: std::time::Duration,
    ) -> Result<DomainCertificate, CaError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(CaError::InvalidHost(host.to_string()));
        }
        debug!("Generating certificate for {}", host);

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::InvalidHost(host.to_string()))?,
            ),
        };

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];

        let validity = Duration::try_from(validity).unwrap_or(Duration::MAX);
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now
            .checked_add(validity)
            .map_or(self.not_after, |end| end.min(self.not_after));

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(DomainCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .field("fingerprint", &hex::encode(self.fingerprint))
            .finish()
    }
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CaError::WriteFile)?;
    file.write_all(content.as_bytes())
        .map_err(CaError::WriteFile)?;
    Ok(())
}
