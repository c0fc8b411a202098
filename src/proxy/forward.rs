//! Signing forward proxy with TLS interception.
//!
//! Clients point their HTTP proxy setting at this listener. The flow for
//! HTTPS is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. Proxy answers `200` and takes over the upgraded connection
//! 3. Proxy completes TLS with the client using a leaf certificate minted
//!    for `api.example.com` by the local CA
//! 4. Each decrypted request is buffered, signed and sent to the real
//!    upstream over TLS; the response is relayed back
//!
//! The upstream connection is opened on the first request and reused for
//! later requests on the same client connection. Plain `http://` requests
//! in absolute form are signed and forwarded without a tunnel.

use super::body::{ProxyBody, collect_body, empty_body, full_body, text_response};
use super::drain::ConnectionGuard;
use super::error::ProxyError;
use super::headers::strip_hop_by_hop;
use super::listener::Stream;
use super::server::{ConnectionHandler, serve_http};
use super::tls::{LeafCertCache, create_intercept_acceptor};
use super::upstream::{Target, UpstreamConnector, UpstreamSession, relay_response};
use crate::auth::Signer;
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signing forward proxy shared by every connection of an instance.
pub struct ForwardProxy {
    signer: Arc<Signer>,
    certs: Arc<LeafCertCache>,
    connector: UpstreamConnector,
    max_body_bytes: usize,
}

impl ForwardProxy {
    /// Create a forward proxy.
    pub fn new(
        signer: Arc<Signer>,
        certs: Arc<LeafCertCache>,
        connector: UpstreamConnector,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            signer,
            certs,
            connector,
            max_body_bytes,
        }
    }

    /// The signer applied to every request.
    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    /// Leaf certificate cache used for interception.
    pub fn certs(&self) -> &Arc<LeafCertCache> {
        &self.certs
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>, guard: ConnectionGuard) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return match self.handle_connect(req, guard) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Rejecting CONNECT: {}", e);
                    text_response(StatusCode::BAD_REQUEST, format!("{}\n", e))
                }
            };
        }

        if req.uri().scheme_str() != Some("http") {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Expected CONNECT or an absolute http:// request\n",
            );
        }

        let target = match Target::from_uri(req.uri()) {
            Ok(target) => target,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("{}\n", e)),
        };
        let result = async {
            let signed = self.prepare(req, &target).await?;
            self.connector.send(&target, signed).await
        }
        .await;
        relay_response(result, &target)
    }

    fn handle_connect(
        self: &Arc<Self>,
        req: Request<Incoming>,
        guard: ConnectionGuard,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?
            .to_string();
        let (host, port) = parse_host_port(&authority)?;
        debug!("CONNECT request to {}:{}", host, port);

        let proxy = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => proxy.intercept(upgraded, host, port, guard).await,
                Err(e) => warn!("HTTP upgrade failed for {}:{}: {}", host, port, e),
            }
        });

        Ok(Response::new(empty_body()))
    }

    /// Terminate client TLS and relay signed requests to the upstream.
    async fn intercept(self: Arc<Self>, upgraded: Upgraded, host: String, port: u16, mut guard: ConnectionGuard) {
        let acceptor = create_intercept_acceptor(self.certs.clone(), Some(host.clone()));
        let client_tls = match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(tls) => tls,
            Err(e) => {
                info!("Client TLS handshake failed for {}: {}", host, e);
                return;
            }
        };
        debug!("TLS established with client for {}:{}", host, port);

        let target = Target {
            https: true,
            host: host.clone(),
            port,
        };
        let session = Arc::new(UpstreamSession::new(target, self.connector.clone()));

        let proxy = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let session = session.clone();
            async move {
                let result = async {
                    let signed = proxy.prepare(req, session.target()).await?;
                    session.send(signed).await
                }
                .await;
                Ok::<_, Infallible>(relay_response(result, session.target()))
            }
        });

        serve_http(client_tls, service, &mut guard).await;
        debug!("Tunnel closed for {}:{}", host, port);
    }

    /// Buffer, clean and sign a request bound for `target`.
    async fn prepare(&self, req: Request<Incoming>, target: &Target) -> Result<Request<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        let body = collect_body(body, self.max_body_bytes).await?;

        strip_hop_by_hop(&mut parts.headers);
        parts.uri = origin_form(&parts.uri)?;
        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&target.host_header())
                .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
            parts.headers.insert(HOST, host);
        }

        let mut request = Request::from_parts(parts, body);
        self.signer.sign(&mut request)?;
        Ok(request.map(full_body))
    }

    /// Release the signer at instance shutdown.
    pub fn stop(&self) {
        self.signer.stop();
    }
}

impl ConnectionHandler for ForwardProxy {
    async fn serve(self: Arc<Self>, stream: Stream, peer: String, mut guard: ConnectionGuard) {
        let proxy = self.clone();
        let tunnel_guard = guard.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let guard = tunnel_guard.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, guard).await) }
        });
        serve_http(stream, service, &mut guard).await;
        debug!(peer = %peer, "Client connection closed");
    }
}

/// Reduce an absolute-form URI to origin form.
fn origin_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let path = if path.is_empty() { "/" } else { path };
    path.parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", path, e)))
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port)))?;
            (host, port)
        }
        _ => (authority, 443),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::InvalidConnect(format!("Missing host in '{}'", authority)));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("api.example.com:8443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("api.example.com").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_invalid_port() {
        assert!(parse_host_port("api.example.com:invalid").is_err());
        assert!(parse_host_port(":443").is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let (host, port) = parse_host_port("[::1]:443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://api.example.com/widgets?page=2".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/widgets?page=2");
        let uri: Uri = "http://api.example.com".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }
}
