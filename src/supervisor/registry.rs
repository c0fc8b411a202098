//! Signing key ids claimed by signer instances.

use super::error::StartupError;
use crate::auth::SigningKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Tracks which secret each signing key id was loaded with.
///
/// A key id may be shared by several signer instances as long as every one
/// loads the same secret. Claims are never released, so an id cannot be
/// rebound to a different secret for the lifetime of the supervisor.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    claims: Mutex<HashMap<String, [u8; 32]>>,
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`'s id for its secret.
    pub fn claim(&self, key: &SigningKey) -> Result<(), StartupError> {
        let digest = key.secret_digest();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(key.id()) {
            Some(existing) if *existing != digest => {
                Err(StartupError::KeyConflict(key.id().to_string()))
            }
            Some(_) => Ok(()),
            None => {
                claims.insert(key.id().to_string(), digest);
                Ok(())
            }
        }
    }

    /// Number of distinct key ids claimed.
    pub fn len(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, secret: &str) -> SigningKey {
        SigningKey::new(id, secret, "", "").unwrap()
    }

    #[test]
    fn test_same_secret_may_be_claimed_twice() {
        let registry = KeyRegistry::new();
        registry.claim(&key("k1", "s3cr3t")).unwrap();
        registry.claim(&key("k1", "s3cr3t")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_secret_is_rejected() {
        let registry = KeyRegistry::new();
        registry.claim(&key("k1", "s3cr3t")).unwrap();
        let err = registry.claim(&key("k1", "other")).unwrap_err();
        assert!(matches!(err, StartupError::KeyConflict(id) if id == "k1"));
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let registry = KeyRegistry::new();
        registry.claim(&key("k1", "a")).unwrap();
        registry.claim(&key("k2", "b")).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
    }
}
