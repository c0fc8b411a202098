//! Configuration schema definitions.
//!
//! A configuration file holds an optional `[supervisor]` table and one
//! `[[proxy]]` table per proxy instance. Each instance is either a signing
//! forward proxy (`mode = "sign"`) or a verifying reverse proxy
//! (`mode = "verify"`).

use super::error::ConfigError;
use crate::proxy::error::ProxyError;
use crate::proxy::listener::ListenAddr;
use crate::proxy::tls::ServerTlsSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Proxy instances, in declaration order.
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyInstanceConfig>,
}

/// Settings for the lifecycle supervisor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// How long a stop may take before instances are force-closed.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl SupervisorConfig {
    /// Stop timeout as a duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// One proxy instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyInstanceConfig {
    /// Instance name used in logs and reports. Defaults to `<mode>-<index>`.
    #[serde(default)]
    pub name: String,

    /// Disabled instances are skipped by the supervisor.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// `host:port` or `unix:<path>`.
    pub listen: String,

    /// Octal permissions for unix listeners, e.g. `"0600"`.
    #[serde(default)]
    pub socket_mode: Option<String>,

    /// Upper bound on this instance's drain; a shorter supervisor stop
    /// timeout still wins.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Largest request body buffered for signing or verification.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Bound on connecting to an upstream, TLS handshake included.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Mode-specific settings.
    #[serde(flatten)]
    pub mode: ModeConfig,
}

impl ProxyInstanceConfig {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e: ProxyError| ConfigError::invalid(self.field("listen"), e.to_string()))
    }

    /// Parsed socket permissions, if set.
    pub fn socket_mode_bits(&self) -> Result<Option<u32>, ConfigError> {
        let Some(mode) = &self.socket_mode else {
            return Ok(None);
        };
        let digits = mode.strip_prefix("0o").unwrap_or(mode);
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|bits| *bits <= 0o7777)
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    self.field("socket_mode"),
                    format!("'{}' is not an octal permission mode", mode),
                )
            })
    }

    /// Drain timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Upstream connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn field(&self, name: &str) -> String {
        format!("proxy.{}.{}", self.name, name)
    }
}

/// Mode of a proxy instance, selected by the `mode` key.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ModeConfig {
    /// Signing forward proxy.
    Sign(SignConfig),
    /// Verifying reverse proxy.
    Verify(VerifyConfig),
}

impl ModeConfig {
    /// `"sign"` or `"verify"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sign(_) => "sign",
            Self::Verify(_) => "verify",
        }
    }
}

/// Settings for a signing forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignConfig {
    /// The signing key.
    pub key: SigningKeyConfig,

    /// Headers signed in addition to `host` when present.
    #[serde(default = "default_signed_headers")]
    pub signed_headers: Vec<String>,

    /// TLS interception settings.
    #[serde(default)]
    pub interception: InterceptionConfig,
}

/// Signing key with its secret inline or in a file.
#[derive(Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKeyConfig {
    /// Key identifier.
    pub id: String,
    /// Inline secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// File holding the secret.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    /// Region scope field.
    #[serde(default)]
    pub region: String,
    /// Service scope field.
    #[serde(default)]
    pub service: String,
}

impl fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("id", &self.id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_file", &self.secret_file)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

/// Local CA and upstream trust for TLS interception.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptionConfig {
    /// CA certificate (PEM). Omit together with `ca_key` for an ephemeral CA.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// CA private key (PEM).
    #[serde(default)]
    pub ca_key: Option<PathBuf>,
    /// Bundles trusted for upstream certificates instead of the system roots.
    #[serde(default)]
    pub trusted_certificates: Vec<PathBuf>,
    /// Skip upstream certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// How long a minted leaf certificate is reused.
    #[serde(default = "default_leaf_ttl_secs")]
    pub leaf_ttl_secs: u64,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            ca_cert: None,
            ca_key: None,
            trusted_certificates: Vec::new(),
            insecure_skip_verify: false,
            leaf_ttl_secs: default_leaf_ttl_secs(),
        }
    }
}

/// Settings for a verifying reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyConfig {
    /// Upstream origin, `http://` or `https://`, optionally with a path prefix.
    pub upstream: String,

    /// Allowed distance between a credential timestamp and now.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,

    /// Extra trust bundle for an https upstream.
    #[serde(default)]
    pub upstream_ca_file: Option<PathBuf>,

    /// Listener TLS; plain HTTP when omitted.
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,

    /// Where key ids are resolved.
    pub credential_source: CredentialSourceConfig,
}

/// Server certificate and optional client-certificate enforcement.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerTlsConfig {
    /// Server certificate chain (PEM).
    pub cert_file: PathBuf,
    /// Server private key (PEM).
    pub key_file: PathBuf,
    /// Bundle used to validate client certificates.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
    /// Reject handshakes without a valid client certificate.
    #[serde(default)]
    pub require_client_certificate: bool,
}

impl From<&ServerTlsConfig> for ServerTlsSettings {
    fn from(config: &ServerTlsConfig) -> Self {
        Self {
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            client_ca_file: config.client_ca_file.clone(),
            require_client_certificate: config.require_client_certificate,
        }
    }
}

/// Credential source, selected by the `type` key.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialSourceConfig {
    /// Keys listed inline.
    Static(StaticSourceConfig),
    /// Keys fetched from a key service.
    Remote(RemoteSourceConfig),
}

/// Inline key table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StaticSourceConfig {
    /// Keys in the table.
    #[serde(default)]
    pub keys: Vec<StaticKeyConfig>,
}

/// One entry of an inline key table.
#[derive(Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StaticKeyConfig {
    /// Key identifier.
    pub id: String,
    /// Inline secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// File holding the secret.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    /// RFC 3339 time after which the key no longer verifies.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for StaticKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyConfig")
            .field("id", &self.id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_file", &self.secret_file)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Remote key service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSourceConfig {
    /// Base URL; the key id is appended as a path segment.
    pub url: String,
    /// How long a fetched key is cached.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// How long an id the service reported unknown is answered locally.
    /// Zero disables negative caching.
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    /// Per-lookup timeout.
    #[serde(default = "default_lookup_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra trust bundle for an https key service.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_enabled() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_signed_headers() -> Vec<String> {
    vec!["content-type".to_string()]
}

fn default_leaf_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_max_clock_skew_secs() -> u64 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_negative_ttl_secs() -> u64 {
    5
}

fn default_lookup_timeout_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [supervisor]
        stop_timeout_secs = 20

        [[proxy]]
        name = "outbound"
        mode = "sign"
        listen = "127.0.0.1:8080"
        signed_headers = ["content-type", "x-request-id"]
        [proxy.key]
        id = "k1"
        secret = "s3cr3t"
        region = "us-east-1"
        service = "widgets"
        [proxy.interception]
        insecure_skip_verify = true

        [[proxy]]
        mode = "verify"
        listen = "unix:/run/hmac-proxy/verify.sock"
        socket_mode = "0660"
        upstream = "http://127.0.0.1:9000/api"
        [proxy.tls]
        cert_file = "/etc/hmac-proxy/server.crt"
        key_file = "/etc/hmac-proxy/server.key"
        [proxy.credential_source]
        type = "static"
        keys = [{ id = "k1", secret = "s3cr3t" }]
    "#;

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(20));
        assert_eq!(config.proxies.len(), 2);

        let outbound = &config.proxies[0];
        assert_eq!(outbound.name, "outbound");
        assert_eq!(outbound.shutdown_timeout_secs, 5);
        let ModeConfig::Sign(sign) = &outbound.mode else {
            panic!("expected sign mode");
        };
        assert_eq!(sign.key.id, "k1");
        assert_eq!(sign.key.region, "us-east-1");
        assert_eq!(sign.signed_headers.len(), 2);
        assert!(sign.interception.insecure_skip_verify);
        assert_eq!(sign.interception.leaf_ttl_secs, 43200);

        let inbound = &config.proxies[1];
        assert_eq!(inbound.socket_mode_bits().unwrap(), Some(0o660));
        let ModeConfig::Verify(verify) = &inbound.mode else {
            panic!("expected verify mode");
        };
        assert_eq!(verify.max_clock_skew_secs, 60);
        assert!(verify.tls.as_ref().is_some_and(|t| !t.require_client_certificate));
        let CredentialSourceConfig::Static(source) = &verify.credential_source else {
            panic!("expected static source");
        };
        assert_eq!(source.keys[0].id, "k1");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[proxy]]
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k1", secret = "x" }
            "#,
        )
        .unwrap();
        assert_eq!(config.supervisor.stop_timeout_secs, 10);
        let proxy = &config.proxies[0];
        assert_eq!(proxy.max_body_bytes, 10 * 1024 * 1024);
        assert!(proxy.enabled);
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(10));
        let ModeConfig::Sign(sign) = &proxy.mode else {
            panic!("expected sign mode");
        };
        assert_eq!(sign.signed_headers, vec!["content-type".to_string()]);
        assert!(sign.interception.ca_cert.is_none());
    }

    #[test]
    fn test_instance_can_be_disabled() {
        let config: Config = toml::from_str(
            r#"
            [[proxy]]
            mode = "sign"
            enabled = false
            listen = "127.0.0.1:0"
            connect_timeout_secs = 3
            key = { id = "k1", secret = "x" }
            "#,
        )
        .unwrap();
        assert!(!config.proxies[0].enabled);
        assert_eq!(config.proxies[0].connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [[proxy]]
            mode = "relay"
            listen = "127.0.0.1:0"
            "#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("relay"), "{}", err);
    }

    #[test]
    fn test_unknown_credential_source_type_is_rejected() {
        let result: Result<CredentialSourceConfig, _> = toml::from_str(
            r#"
            type = "ldap"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_credential_source_field_is_rejected() {
        let result: Result<CredentialSourceConfig, _> = toml::from_str(
            r#"
            type = "remote"
            url = "https://keys.internal/v1/keys"
            retries = 3
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_remote_source_defaults() {
        let source: CredentialSourceConfig = toml::from_str(
            r#"
            type = "remote"
            url = "https://keys.internal/v1/keys"
            "#,
        )
        .unwrap();
        let CredentialSourceConfig::Remote(remote) = source else {
            panic!("expected remote source");
        };
        assert_eq!(remote.cache_ttl_secs, 300);
        assert_eq!(remote.negative_ttl_secs, 5);
        assert_eq!(remote.timeout_secs, 5);
    }

    #[test]
    fn test_socket_mode_rejects_non_octal() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        config.proxies[1].socket_mode = Some("0999".to_string());
        assert!(config.proxies[1].socket_mode_bits().is_err());
    }

    #[test]
    fn test_key_debug_redacts_secret() {
        let config: Config = toml::from_str(FULL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cr3t"));
    }
}
