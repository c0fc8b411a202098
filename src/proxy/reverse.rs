//! Verifying reverse proxy.
//!
//! Sits in front of a single upstream origin. Every request is buffered and
//! run through the [`Verifier`]; rejected requests get a `401` and never
//! reach the upstream. Accepted requests are forwarded unchanged apart from
//! hop-by-hop headers and the upstream path prefix.
//!
//! TLS is optional. With client-certificate enforcement, connections without
//! a valid client certificate fail the handshake and never get this far.

use super::body::{ProxyBody, collect_body, full_body, text_response, unauthorized};
use super::drain::ConnectionGuard;
use super::error::ProxyError;
use super::headers::strip_hop_by_hop;
use super::listener::Stream;
use super::server::{ConnectionHandler, serve_http};
use super::upstream::{Target, UpstreamConnector, UpstreamSession, relay_response};
use crate::auth::Verifier;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Verifying reverse proxy shared by every connection of an instance.
pub struct ReverseProxy {
    verifier: Arc<Verifier>,
    upstream: Uri,
    target: Target,
    connector: UpstreamConnector,
    tls: Option<TlsAcceptor>,
    max_body_bytes: usize,
}

impl ReverseProxy {
    /// Create a reverse proxy forwarding to `upstream`.
    pub fn new(
        verifier: Arc<Verifier>,
        upstream: Uri,
        connector: UpstreamConnector,
        tls: Option<TlsAcceptor>,
        max_body_bytes: usize,
    ) -> Result<Self, ProxyError> {
        let target = Target::from_uri(&upstream)?;
        Ok(Self {
            verifier,
            upstream,
            target,
            connector,
            tls,
            max_body_bytes,
        })
    }

    /// The verifier gating every request.
    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    async fn handle(&self, req: Request<Incoming>, session: &UpstreamSession) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match collect_body(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Rejecting unreadable request: {}", e);
                return text_response(StatusCode::BAD_REQUEST, format!("{}\n", e));
            }
        };

        let request = Request::from_parts(parts, body);
        let credential = match self.verifier.verify(&request).await {
            Ok(credential) => credential,
            Err(e) => {
                info!(
                    reason = e.kind(),
                    method = %request.method(),
                    path = %request.uri().path(),
                    "Rejected request: {}", e
                );
                return unauthorized(&e);
            }
        };
        debug!(key_id = %credential.scope.key_id, path = %request.uri().path(), "Request verified");

        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.uri = match upstream_uri(&self.upstream, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("{}\n", e)),
        };
        let forwarded = Request::from_parts(parts, full_body(body));

        relay_response(session.send(forwarded).await, &self.target)
    }

    /// Release the verifier at instance shutdown.
    pub async fn stop(&self) {
        self.verifier.stop().await;
    }
}

impl ConnectionHandler for ReverseProxy {
    async fn serve(self: Arc<Self>, stream: Stream, peer: String, mut guard: ConnectionGuard) {
        let session = Arc::new(UpstreamSession::new(self.target.clone(), self.connector.clone()));
        let proxy = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let session = session.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, &session).await) }
        });

        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => serve_http(tls, service, &mut guard).await,
                Err(e) => info!(peer = %peer, "TLS handshake failed: {}", e),
            },
            None => serve_http(stream, service, &mut guard).await,
        }
    }
}

/// Join the upstream base path with the request path; the query is kept.
fn upstream_uri(base: &Uri, request: &Uri) -> Result<Uri, ProxyError> {
    let prefix = base.path().trim_end_matches('/');
    let path = request.path();
    let joined = match request.query() {
        Some(query) => format!("{}{}?{}", prefix, path, query),
        None => format!("{}{}", prefix, path),
    };
    joined
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", joined, e)))
}
