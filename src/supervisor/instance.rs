//! Building and running one proxy instance.
//!
//! Startup order is: build the core filter (key, CA, credential source,
//! TLS material), then bind the listener. Nothing is bound for an instance
//! whose filter fails to build.
//!
//! Stop order is: drop the listener, drain connections until the deadline,
//! force-close the rest, then stop the core filter.

use super::abort::AbortReporter;
use super::error::{InstanceError, StartupError};
use super::registry::KeyRegistry;
use crate::auth::{Signer, SigningKey, Verifier};
use crate::config::{ConfigError, ModeConfig, ProxyInstanceConfig, SignConfig, VerifyConfig};
use crate::credentials;
use crate::proxy::ca::CertificateAuthority;
use crate::proxy::drain::DrainOutcome;
use crate::proxy::forward::ForwardProxy;
use crate::proxy::listener::{BoundAddr, Listener};
use crate::proxy::reverse::ReverseProxy;
use crate::proxy::server;
use crate::proxy::tls::{
    LeafCertCache, ServerTlsSettings, UpstreamTrust, create_server_acceptor, create_tls_connector,
};
use crate::proxy::upstream::UpstreamConnector;
use hyper::Uri;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Health of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Building the filter or binding the listener.
    Starting,
    /// Accepting connections on the given address.
    Running(BoundAddr),
    /// Startup failed.
    Failed(String),
    /// Drained and stopped.
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running(addr) => write!(f, "running on {}", addr),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How an instance task ended.
#[derive(Debug)]
pub(crate) struct InstanceExit {
    pub name: String,
    /// `None` when the instance never started.
    pub drain: Option<DrainOutcome>,
}

/// Everything an instance task needs from the supervisor.
pub(crate) struct InstanceContext {
    pub config: ProxyInstanceConfig,
    pub registry: Arc<KeyRegistry>,
    pub abort: AbortReporter,
    pub stop: watch::Receiver<Option<Instant>>,
    pub state: watch::Sender<InstanceState>,
}

/// The core filter of an instance.
enum Core {
    Forward(Arc<ForwardProxy>),
    Reverse(Arc<ReverseProxy>),
}

/// Run an instance from startup to stop.
pub(crate) async fn run(ctx: InstanceContext) -> InstanceExit {
    let name = ctx.config.name.clone();
    let mode = ctx.config.mode.name();

    let (listener, core) = match start(&ctx.config, &ctx.registry).await {
        Ok(started) => started,
        Err(source) => {
            ctx.state.send_replace(InstanceState::Failed(source.to_string()));
            ctx.abort.report(InstanceError {
                instance: name.clone(),
                mode,
                source,
            });
            return InstanceExit { name, drain: None };
        }
    };

    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            ctx.state.send_replace(InstanceState::Failed(e.to_string()));
            ctx.abort.report(InstanceError {
                instance: name.clone(),
                mode,
                source: e.into(),
            });
            return InstanceExit { name, drain: None };
        }
    };
    info!(instance = %name, mode, addr = %addr, "Starting {} proxy", mode);
    ctx.state.send_replace(InstanceState::Running(addr));

    let drain_limit = ctx.config.shutdown_timeout();
    let outcome = match core {
        Core::Forward(proxy) => {
            let outcome = server::run(listener, proxy.clone(), ctx.stop, drain_limit).await;
            proxy.stop();
            outcome
        }
        Core::Reverse(proxy) => {
            let outcome = server::run(listener, proxy.clone(), ctx.stop, drain_limit).await;
            proxy.stop().await;
            outcome
        }
    };

    match outcome {
        DrainOutcome::Drained => info!(instance = %name, "Stopped {} proxy", mode),
        DrainOutcome::Forced { open } => warn!(
            instance = %name,
            open,
            "Stopped {} proxy after force-closing connections", mode
        ),
    }
    ctx.state.send_replace(InstanceState::Stopped);
    InstanceExit {
        name,
        drain: Some(outcome),
    }
}

async fn start(
    config: &ProxyInstanceConfig,
    registry: &KeyRegistry,
) -> Result<(Listener, Core), StartupError> {
    let addr = config.listen_addr()?;
    let core = match &config.mode {
        ModeConfig::Sign(sign) => Core::Forward(Arc::new(build_forward(config, sign, registry)?)),
        ModeConfig::Verify(verify) => Core::Reverse(Arc::new(build_reverse(config, verify)?)),
    };

    let listener = Listener::bind(&addr, config.socket_mode_bits()?).await?;
    Ok((listener, core))
}

fn build_forward(
    config: &ProxyInstanceConfig,
    sign: &SignConfig,
    registry: &KeyRegistry,
) -> Result<ForwardProxy, StartupError> {
    let key = &sign.key;
    let signing_key = match (&key.secret, &key.secret_file) {
        (Some(secret), None) => SigningKey::new(
            key.id.as_str(),
            secret.as_bytes(),
            key.region.as_str(),
            key.service.as_str(),
        )?,
        (None, Some(path)) => SigningKey::from_secret_file(
            key.id.as_str(),
            path,
            key.region.as_str(),
            key.service.as_str(),
        )?,
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                config.field("key"),
                "set either secret or secret_file, not both",
            )
            .into());
        }
        (None, None) => {
            return Err(
                ConfigError::invalid(config.field("key"), "missing secret or secret_file").into(),
            );
        }
    };
    registry.claim(&signing_key)?;
    let signer = Signer::new(signing_key, &sign.signed_headers)?;

    let interception = &sign.interception;
    let ca = match (&interception.ca_cert, &interception.ca_key) {
        (Some(cert), Some(key)) => CertificateAuthority::from_pem_files(cert, key)?,
        (None, None) => {
            let ca = CertificateAuthority::generate()?;
            info!(
                instance = %config.name,
                ca_cert = %ca.cert_path().display(),
                "Generated ephemeral interception CA"
            );
            ca
        }
        _ => {
            return Err(ConfigError::invalid(
                config.field("interception"),
                "ca_cert and ca_key must be set together",
            )
            .into());
        }
    };
    let certs = LeafCertCache::new(
        Arc::new(ca),
        Duration::from_secs(interception.leaf_ttl_secs),
    );

    let trust = if interception.insecure_skip_verify {
        UpstreamTrust::Insecure
    } else if !interception.trusted_certificates.is_empty() {
        UpstreamTrust::Bundle(interception.trusted_certificates.clone())
    } else {
        UpstreamTrust::System { extra: Vec::new() }
    };
    let connector = UpstreamConnector::new(create_tls_connector(&trust)?)
        .with_connect_timeout(config.connect_timeout());

    Ok(ForwardProxy::new(
        Arc::new(signer),
        Arc::new(certs),
        connector,
        config.max_body_bytes,
    ))
}

fn build_reverse(
    config: &ProxyInstanceConfig,
    verify: &VerifyConfig,
) -> Result<ReverseProxy, StartupError> {
    let source = credentials::from_config(&verify.credential_source)?;
    let verifier = Verifier::new(source, Duration::from_secs(verify.max_clock_skew_secs));

    let upstream: Uri = verify.upstream.parse().map_err(|e| {
        ConfigError::invalid(
            config.field("upstream"),
            format!("'{}': {}", verify.upstream, e),
        )
    })?;
    let trust = UpstreamTrust::System {
        extra: verify.upstream_ca_file.iter().cloned().collect(),
    };
    let connector = UpstreamConnector::new(create_tls_connector(&trust)?)
        .with_connect_timeout(config.connect_timeout());

    let tls = verify
        .tls
        .as_ref()
        .map(|tls| create_server_acceptor(&ServerTlsSettings::from(tls)))
        .transpose()?;

    Ok(ReverseProxy::new(
        Arc::new(verifier),
        upstream,
        connector,
        tls,
        config.max_body_bytes,
    )?)
}
