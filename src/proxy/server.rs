//! Accept loop and per-connection HTTP serving.
//!
//! Both proxy modes share this loop. Each accepted connection is handled in
//! its own Tokio task and holds a [`ConnectionGuard`] so stop can drain it.
//!
//! Stop sequence:
//! 1. the stop channel carries a deadline; the loop exits and the listener is
//!    dropped, so new connections are refused immediately
//! 2. connections finish their in-flight request, idle ones close at once
//! 3. at the deadline whatever is left is force-closed

use super::drain::{ConnectionGuard, ConnectionTracker, DrainOutcome};
use super::listener::{Listener, Stream};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::body::ProxyBody;

/// Handles one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve `stream` until it closes or the guard says to stop.
    fn serve(
        self: Arc<Self>,
        stream: Stream,
        peer: String,
        guard: ConnectionGuard,
    ) -> impl Future<Output = ()> + Send;
}

/// Run the accept loop until a stop deadline arrives, then drain.
///
/// `stop` carries `None` while running and the drain deadline once stop is
/// requested. A closed stop channel counts as an immediate stop. The drain
/// never runs longer than `drain_limit` past the stop request.
pub async fn run<H: ConnectionHandler>(
    listener: Listener,
    handler: Arc<H>,
    mut stop: watch::Receiver<Option<Instant>>,
    drain_limit: Duration,
) -> DrainOutcome {
    let tracker = ConnectionTracker::new();

    let deadline = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let guard = tracker.track();
                        tokio::spawn(handler.clone().serve(stream, peer, guard));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            requested = stop.wait_for(Option::is_some) => {
                let limit = Instant::now() + drain_limit;
                break match requested {
                    Ok(deadline) => (*deadline).map_or(limit, |d| d.min(limit)),
                    Err(_) => Instant::now(),
                };
            }
        }
    };

    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    drop(listener);
    info!(addr = %addr, open = tracker.active(), "Listener closed, draining");

    tracker.drain(deadline).await
}

/// Serve HTTP/1.1 on `io` with upgrade support, honouring the drain phase.
pub async fn serve_http<I, S, E>(io: I, service: S, guard: &mut ConnectionGuard)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = E>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = guard.draining() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = guard.forced() => {
                    debug!("Force-closing connection");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        if is_disconnect(&e) {
            debug!("Connection ended: {}", e);
        } else {
            warn!("Connection error: {}", e);
        }
    }
}

fn is_disconnect(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_canceled() {
        return true;
    }
    let text = err.to_string().to_lowercase();
    text.contains("connection reset") || text.contains("broken pipe")
}
