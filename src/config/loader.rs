//! Configuration loading and validation.
//!
//! The configuration comes from a single TOML file named on the command
//! line. `$VAR` and `${VAR}` in that path are expanded from the
//! environment. After parsing, the loader fills in default instance names
//! and checks everything that can be checked without touching key or
//! certificate files; those are read when an instance starts.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use hyper::Uri;
use tracing::{debug, warn};

use super::error::ConfigError;
use super::schema::{Config, CredentialSourceConfig, ModeConfig, ProxyInstanceConfig};
use crate::proxy::listener::ListenAddr;
use crate::proxy::upstream::Target;

/// Loads the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for `path`, expanding environment variables in it.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        let raw = path.as_ref().to_string_lossy();
        Self {
            path: PathBuf::from(expand_env_vars(&raw)),
        }
    }

    /// The expanded configuration path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the configuration.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| ConfigError::ReadError {
            path: self.path.clone(),
            source: e,
        })?;
        let config = self.parse(&contents)?;
        debug!(
            "Loaded {} proxy instance(s) from {:?}",
            config.proxies.len(),
            self.path
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(&self, contents: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(contents).map_err(|e| ConfigError::ParseError {
            path: self.path.clone(),
            source: e,
        })?;
        validate(&mut config)?;
        Ok(config)
    }
}

/// Fill in defaults and check a parsed configuration.
pub fn validate(config: &mut Config) -> Result<(), ConfigError> {
    if config.proxies.is_empty() {
        return Err(ConfigError::invalid(
            "proxy",
            "at least one [[proxy]] instance is required",
        ));
    }

    let mut names = HashSet::new();
    for (index, proxy) in config.proxies.iter_mut().enumerate() {
        if proxy.name.trim().is_empty() {
            proxy.name = format!("{}-{}", proxy.mode.name(), index);
        }
        if !names.insert(proxy.name.clone()) {
            return Err(ConfigError::invalid(
                "proxy.name",
                format!("duplicate instance name '{}'", proxy.name),
            ));
        }
        validate_instance(proxy)?;
    }
    Ok(())
}

/// The listen address is parsed when the instance starts, so a bad one fails
/// only that instance.
fn validate_instance(proxy: &ProxyInstanceConfig) -> Result<(), ConfigError> {
    let tcp_listener = matches!(proxy.listen_addr(), Ok(ListenAddr::Tcp(_)));
    if proxy.socket_mode_bits()?.is_some() && tcp_listener {
        warn!(
            instance = %proxy.name,
            "socket_mode only applies to unix listeners; ignoring it"
        );
    }
    if proxy.max_body_bytes == 0 {
        return Err(ConfigError::invalid(
            proxy.field("max_body_bytes"),
            "must be greater than zero",
        ));
    }

    match &proxy.mode {
        ModeConfig::Sign(sign) => {
            if sign.key.id.is_empty() {
                return Err(ConfigError::invalid(proxy.field("key.id"), "must not be empty"));
            }
            let interception = &sign.interception;
            if interception.ca_cert.is_some() != interception.ca_key.is_some() {
                return Err(ConfigError::invalid(
                    proxy.field("interception"),
                    "ca_cert and ca_key must be set together",
                ));
            }
        }
        ModeConfig::Verify(verify) => {
            check_url(proxy, "upstream", &verify.upstream)?;
            if let CredentialSourceConfig::Remote(remote) = &verify.credential_source {
                check_url(proxy, "credential_source.url", &remote.url)?;
            }
        }
    }
    Ok(())
}

fn check_url(proxy: &ProxyInstanceConfig, field: &str, value: &str) -> Result<(), ConfigError> {
    let uri: Uri = value
        .parse()
        .map_err(|e| ConfigError::invalid(proxy.field(field), format!("'{}': {}", value, e)))?;
    Target::from_uri(&uri)
        .map(|_| ())
        .map_err(|e| ConfigError::invalid(proxy.field(field), e.to_string()))
}

/// Expand `$VAR` and `${VAR}` from the environment.
///
/// Unset variables are left as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(expanded) if !name.is_empty() => out.push_str(&expanded),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> ConfigLoader {
        ConfigLoader::new("/etc/hmac-proxy/config.toml")
    }

    const SIGNER: &str = r#"
        [[proxy]]
        mode = "sign"
        listen = "127.0.0.1:0"
        key = { id = "k1", secret = "s3cr3t" }
    "#;

    #[test]
    fn test_default_names_are_assigned() {
        let text = format!(
            "{}{}",
            SIGNER,
            r#"
            [[proxy]]
            name = "inbound"
            mode = "verify"
            listen = "127.0.0.1:0"
            upstream = "http://127.0.0.1:9000"
            credential_source = { type = "static", keys = [] }
            "#
        );
        let config = loader().parse(&text).unwrap();
        assert_eq!(config.proxies[0].name, "sign-0");
        assert_eq!(config.proxies[1].name, "inbound");
    }

    #[test]
    fn test_empty_config_is_rejected() {
        let err = loader().parse("").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let text = r#"
            [[proxy]]
            name = "a"
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k1", secret = "x" }

            [[proxy]]
            name = "a"
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k2", secret = "y" }
        "#;
        let err = loader().parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }

    #[test]
    fn test_bad_listen_address_is_left_to_instance_start() {
        let text = SIGNER.replace("127.0.0.1:0", "not-an-address");
        let config = loader().parse(&text).unwrap();
        assert_eq!(config.proxies[0].listen, "not-an-address");
        assert!(config.proxies[0].listen_addr().is_err());
    }

    #[test]
    fn test_bad_upstream_is_rejected() {
        let text = r#"
            [[proxy]]
            mode = "verify"
            listen = "127.0.0.1:0"
            upstream = "ftp://files.internal"
            credential_source = { type = "static", keys = [] }
        "#;
        let err = loader().parse(text).unwrap_err();
        assert!(err.to_string().contains("upstream"), "{}", err);
    }

    #[test]
    fn test_half_configured_ca_is_rejected() {
        let text = format!("{}\ninterception = {{ ca_cert = \"/tmp/ca.crt\" }}\n", SIGNER);
        let err = loader().parse(&text).unwrap_err();
        assert!(err.to_string().contains("ca_key"), "{}", err);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = loader().parse("[[proxy]\nmode =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SIGNER).unwrap();

        let config = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new(dir.path().join("absent.toml"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_expand_env_vars() {
        let home = std::env::var("HOME").unwrap_or_default();
        if !home.is_empty() {
            assert_eq!(expand_env_vars("$HOME/x"), format!("{}/x", home));
            assert_eq!(expand_env_vars("${HOME}/x"), format!("{}/x", home));
        }
        assert_eq!(
            expand_env_vars("/etc/$HMAC_PROXY_SURELY_UNSET_VAR/x"),
            "/etc/$HMAC_PROXY_SURELY_UNSET_VAR/x"
        );
        assert_eq!(expand_env_vars("/etc/${unterminated"), "/etc/${unterminated");
        assert_eq!(expand_env_vars("cost: $"), "cost: $");
    }
}
