//! Signing key material.

use super::credential::Scope;
use super::error::SignError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

/// A shared-secret signing key with its scope fields.
///
/// Immutable once loaded. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    id: String,
    secret: Vec<u8>,
    region: String,
    service: String,
}

impl SigningKey {
    /// Create a key from an inline secret.
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, SignError> {
        let key = Self {
            id: id.into(),
            secret: secret.into(),
            region: region.into(),
            service: service.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Create a key whose secret is read from a file.
    ///
    /// A single trailing newline is stripped so secrets written with `echo`
    /// behave the same as inline ones.
    pub fn from_secret_file(
        id: impl Into<String>,
        path: &Path,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, SignError> {
        let mut secret = fs::read(path).map_err(|source| SignError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        strip_trailing_newline(&mut secret);
        Self::new(id, secret, region, service)
    }

    fn validate(&self) -> Result<(), SignError> {
        validate_key_id(&self.id).map_err(SignError::InvalidKey)?;
        if self.secret.is_empty() {
            return Err(SignError::InvalidKey(format!(
                "key '{}' has an empty secret",
                self.id
            )));
        }
        for (field, value) in [("region", &self.region), ("service", &self.service)] {
            if value.contains(['/', ',']) || value.chars().any(char::is_whitespace) {
                return Err(SignError::InvalidKey(format!(
                    "{} '{}' may not contain '/', ',' or whitespace",
                    field, value
                )));
            }
        }
        Ok(())
    }

    /// Key identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw secret bytes.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Scope carried in every credential produced with this key.
    pub fn scope(&self) -> Scope {
        Scope {
            key_id: self.id.clone(),
            region: self.region.clone(),
            service: self.service.clone(),
        }
    }

    /// SHA-256 digest of the secret, used to detect an id reused with a
    /// different secret without keeping a second copy of the secret.
    pub fn secret_digest(&self) -> [u8; 32] {
        Sha256::digest(&self.secret).into()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

/// Check that a key id can travel inside the credential header.
pub fn validate_key_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("key id is empty".to_string());
    }
    if id.contains(['/', ',', '=']) || id.chars().any(char::is_whitespace) {
        return Err(format!(
            "key id '{}' may not contain '/', ',', '=' or whitespace",
            id
        ));
    }
    Ok(())
}

pub(crate) fn strip_trailing_newline(bytes: &mut Vec<u8>) {
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_debug_redacts_secret() {
        let key = SigningKey::new("k1", "s3cr3t", "us-east-1", "widgets").unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("k1"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn test_key_rejects_bad_id() {
        assert!(SigningKey::new("", "secret", "", "").is_err());
        assert!(SigningKey::new("a/b", "secret", "", "").is_err());
        assert!(SigningKey::new("a b", "secret", "", "").is_err());
    }

    #[test]
    fn test_key_rejects_empty_secret() {
        let result = SigningKey::new("k1", "", "", "");
        assert!(matches!(result, Err(SignError::InvalidKey(_))));
    }

    #[test]
    fn test_key_rejects_bad_scope() {
        assert!(SigningKey::new("k1", "secret", "us/east", "").is_err());
        assert!(SigningKey::new("k1", "secret", "", "a,b").is_err());
    }

    #[test]
    fn test_key_from_secret_file_strips_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1.secret");
        fs::write(&path, "s3cr3t\n").unwrap();

        let key = SigningKey::from_secret_file("k1", &path, "", "").unwrap();
        assert_eq!(key.secret(), b"s3cr3t");
    }

    #[test]
    fn test_key_from_missing_file() {
        let result = SigningKey::from_secret_file("k1", Path::new("/nonexistent/k1"), "", "");
        assert!(matches!(result, Err(SignError::KeyFile { .. })));
    }

    #[test]
    fn test_secret_digest_differs_per_secret() {
        let a = SigningKey::new("k1", "one", "", "").unwrap();
        let b = SigningKey::new("k1", "two", "", "").unwrap();
        assert_ne!(a.secret_digest(), b.secret_digest());
    }
}
