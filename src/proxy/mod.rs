//! Network plumbing for both proxy modes.
//!
//! - [`forward`]: signing forward proxy with CONNECT-based TLS interception
//! - [`reverse`]: verifying reverse proxy in front of one upstream origin
//! - [`ca`] and [`tls`]: local CA, leaf certificate cache, acceptors and
//!   the upstream connector
//! - [`server`], [`listener`] and [`drain`]: the accept loop shared by both
//!   modes and its graceful stop
//!
//! # Architecture
//!
//! ```text
//!  client ──CONNECT──▶ ForwardProxy ──signed request over TLS──▶ ReverseProxy
//!                      (minted leaf)                               │ verify
//!                                                                  ▼
//!                                                               service
//! ```

pub mod body;
pub mod ca;
pub mod drain;
pub mod error;
pub mod forward;
pub mod headers;
pub mod listener;
pub mod reverse;
pub mod server;
pub mod tls;
pub mod upstream;

// Re-export main types for convenient access
pub use ca::CertificateAuthority;
pub use drain::DrainOutcome;
pub use error::{CaError, ProxyError};
pub use forward::ForwardProxy;
pub use listener::{BoundAddr, ListenAddr, Listener};
pub use reverse::ReverseProxy;
pub use tls::{LeafCertCache, UpstreamTrust, create_server_acceptor, create_tls_connector};
pub use upstream::{Target, UpstreamConnector};
