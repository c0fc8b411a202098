//! hmac-proxy: request-level HMAC authentication for service-to-service HTTP.
//!
//! Two cooperating proxies add authentication without touching the services
//! themselves:
//!
//! - A **signing forward proxy** sits in front of an outbound client,
//!   intercepts its TLS with a local CA and attaches an HMAC credential to
//!   every request.
//! - A **verifying reverse proxy** sits in front of an inbound service and
//!   rejects any request whose credential is missing, malformed, unknown,
//!   forged or stale before it reaches the service.
//!
//! # Architecture
//!
//! - **Auth**: canonical request, signer and verifier
//! - **Credentials**: pluggable key lookup (static table or remote service)
//! - **Proxy**: listeners, TLS interception, forwarding and graceful drain
//! - **Supervisor**: runs any number of instances with first-error-wins abort
//! - **Config**: TOML configuration describing the instances

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod proxy;
pub mod supervisor;
