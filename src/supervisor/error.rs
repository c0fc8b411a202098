//! Instance startup errors.

use crate::auth::SignError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::proxy::error::{CaError, ProxyError};
use thiserror::Error;

/// Why an instance failed to start.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The instance configuration could not be turned into settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The signing key could not be loaded.
    #[error(transparent)]
    Key(#[from] SignError),

    /// The signing key id is already in use with a different secret.
    #[error("Signing key '{0}' is already loaded with a different secret")]
    KeyConflict(String),

    /// The interception CA could not be loaded or generated.
    #[error(transparent)]
    Ca(#[from] CaError),

    /// The credential source could not be built.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Listener, TLS or upstream setup failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// A startup failure attributed to one instance.
#[derive(Debug, Error)]
#[error("{mode} proxy '{instance}' failed to start: {source}")]
pub struct InstanceError {
    /// Instance name.
    pub instance: String,
    /// `"sign"` or `"verify"`.
    pub mode: &'static str,
    /// The underlying failure.
    #[source]
    pub source: StartupError,
}
