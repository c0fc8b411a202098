//! Connections to upstream origins.

use super::body::{ProxyBody, bad_gateway};
use super::error::ProxyError;
use super::headers::strip_hop_by_hop;
use super::tls::host_to_server_name;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// An upstream origin: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Whether to speak TLS.
    pub https: bool,
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Target {
    /// Build from an absolute `http://` or `https://` URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => {
                return Err(ProxyError::InvalidTarget(format!(
                    "unsupported scheme '{}'",
                    other
                )));
            }
            None => return Err(ProxyError::InvalidTarget(format!("'{}' has no scheme", uri))),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidTarget(format!("'{}' has no host", uri)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self { https, host, port })
    }

    /// `host:port` suitable for connecting (IPv6 bracketed).
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` header; the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        if self.port == default_port {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Default bound on TCP connect plus TLS and HTTP handshakes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens HTTP/1.1 connections to upstream origins.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Create a connector using `tls` for https targets.
    pub fn new(tls: TlsConnector) -> Self {
        Self {
            tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound the time spent establishing each connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Open a connection and complete the HTTP/1.1 handshake.
    ///
    /// Fails with [`ProxyError::Timeout`] when connecting and both
    /// handshakes take longer than the connect timeout. The connection
    /// driver runs on its own task and ends when the returned sender is
    /// dropped or the peer closes.
    pub async fn connect(&self, target: &Target) -> Result<SendRequest<ProxyBody>, ProxyError> {
        tokio::time::timeout(self.connect_timeout, self.open(target))
            .await
            .map_err(|_| ProxyError::Timeout {
                addr: target.authority(),
                after: self.connect_timeout,
            })?
    }

    async fn open(&self, target: &Target) -> Result<SendRequest<ProxyBody>, ProxyError> {
        let addr = target.authority();
        let upstream_err = |message: String| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message,
        };

        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| upstream_err(e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        if target.https {
            let server_name = host_to_server_name(&target.host)?;
            let tls = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| upstream_err(format!("TLS handshake failed: {}", e)))?;
            debug!("TLS established with upstream {}", addr);
            handshake(TokioIo::new(tls), &addr).await
        } else {
            handshake(TokioIo::new(tcp), &addr).await
        }
    }

    /// Send a single request over a fresh connection.
    pub async fn send(
        &self,
        target: &Target,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let mut sender = self.connect(target).await?;
        sender.send_request(request).await.map_err(|e| ProxyError::UpstreamConnect {
            addr: target.authority(),
            message: e.to_string(),
        })
    }
}

async fn handshake<I>(io: TokioIo<I>, addr: &str) -> Result<SendRequest<ProxyBody>, ProxyError>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;

    let addr = addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection to {} ended: {}", addr, e);
        }
    });
    Ok(sender)
}

/// A lazily opened upstream connection reused for consecutive requests.
///
/// One session belongs to one client connection, so requests through it are
/// already sequential; the lock only guards the slot.
pub struct UpstreamSession {
    target: Target,
    connector: UpstreamConnector,
    sender: Mutex<Option<SendRequest<ProxyBody>>>,
}

impl UpstreamSession {
    /// Create a session; nothing is connected until the first request.
    pub fn new(target: Target, connector: UpstreamConnector) -> Self {
        Self {
            target,
            connector,
            sender: Mutex::new(None),
        }
    }

    /// The origin this session talks to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Send a request, reconnecting if the previous connection is gone.
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        let mut slot = self.sender.lock().await;
        let mut sender = match slot.take() {
            Some(mut sender) => {
                if sender.ready().await.is_ok() {
                    sender
                } else {
                    debug!("Upstream connection to {} closed, reconnecting", self.target);
                    self.connector.connect(&self.target).await?
                }
            }
            None => self.connector.connect(&self.target).await?,
        };

        let result = sender.send_request(req).await;
        *slot = Some(sender);
        result.map_err(|e| ProxyError::UpstreamConnect {
            addr: self.target.authority(),
            message: e.to_string(),
        })
    }
}

/// Turn an upstream result into the response sent back to the client.
///
/// Hop-by-hop headers are dropped; upstream failures become `502`.
pub fn relay_response(
    result: Result<Response<Incoming>, ProxyError>,
    target: &Target,
) -> Response<ProxyBody> {
    match result {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            debug!(upstream = %target, status = %parts.status, "Relayed response");
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            warn!(upstream = %target, "Forwarding failed: {}", e);
            bad_gateway(&e)
        }
    }
}

impl fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
