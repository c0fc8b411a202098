//! Request authentication core.
//!
//! The [`Signer`] attaches an HMAC-SHA256 credential to outbound requests and
//! the [`Verifier`] checks it on the way in. Both reduce the request to a
//! [`CanonicalRequest`] first so they always MAC identical bytes.

pub mod canonical;
pub mod credential;
pub mod error;
pub mod key;
pub mod signer;
pub mod verifier;

pub use canonical::CanonicalRequest;
pub use credential::{AUTH_SCHEME, CREDENTIAL_HEADER, Scope, SignatureCredential};
pub use error::{AuthError, SignError};
pub use key::SigningKey;
pub use signer::Signer;
pub use verifier::{DEFAULT_MAX_CLOCK_SKEW, Verifier};
