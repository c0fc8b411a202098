//! Configuration system for hmac-proxy.
//!
//! One TOML file describes every proxy instance the process runs:
//!
//! ```toml
//! [supervisor]
//! stop_timeout_secs = 10
//!
//! [[proxy]]
//! name = "outbound"
//! mode = "sign"
//! listen = "127.0.0.1:8080"
//! key = { id = "k1", secret_file = "/run/secrets/k1" }
//!
//! [[proxy]]
//! name = "inbound"
//! mode = "verify"
//! listen = "0.0.0.0:8443"
//! upstream = "http://127.0.0.1:9000"
//! credential_source = { type = "static", keys = [{ id = "k1", secret_file = "/run/secrets/k1" }] }
//! ```
//!
//! The loaded [`Config`] is passed explicitly to the supervisor; there is no
//! process-wide default.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, expand_env_vars, validate};
pub use schema::{
    Config, CredentialSourceConfig, InterceptionConfig, ModeConfig, ProxyInstanceConfig,
    RemoteSourceConfig, ServerTlsConfig, SignConfig, SigningKeyConfig, StaticKeyConfig,
    StaticSourceConfig, SupervisorConfig, VerifyConfig,
};
