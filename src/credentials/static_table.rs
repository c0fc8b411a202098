//! Fixed in-memory credential table.

use super::{CredentialError, CredentialRecord, CredentialSource, ResolveError};
use async_trait::async_trait;
use std::collections::HashMap;

/// Credential source backed by a table loaded once at startup.
///
/// Read-only after construction, so lookups need no locking.
#[derive(Debug)]
pub struct StaticCredentialSource {
    records: HashMap<String, CredentialRecord>,
}

impl StaticCredentialSource {
    /// Build the table. Duplicate ids are rejected.
    pub fn new(records: Vec<CredentialRecord>) -> Result<Self, CredentialError> {
        let mut table = HashMap::with_capacity(records.len());
        for record in records {
            let id = record.id().to_string();
            if table.insert(id.clone(), record).is_some() {
                return Err(CredentialError::DuplicateId(id));
            }
        }
        Ok(Self { records: table })
    }

    /// Number of keys in the table.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self, id: &str) -> Result<CredentialRecord, ResolveError> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolve() {
        let source = StaticCredentialSource::new(vec![
            CredentialRecord::new("k1", "one", None),
            CredentialRecord::new("k2", "two", None),
        ])
        .unwrap();

        assert_eq!(source.resolve("k2").await.unwrap().secret(), b"two");
        assert_eq!(
            source.resolve("k3").await.unwrap_err(),
            ResolveError::NotFound("k3".to_string())
        );
    }

    #[tokio::test]
    async fn test_static_resolve_is_idempotent() {
        let source =
            StaticCredentialSource::new(vec![CredentialRecord::new("k1", "one", None)]).unwrap();
        let a = source.resolve("k1").await.unwrap();
        let b = source.resolve("k1").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_static_rejects_duplicates() {
        let result = StaticCredentialSource::new(vec![
            CredentialRecord::new("k1", "one", None),
            CredentialRecord::new("k1", "two", None),
        ]);
        assert!(matches!(result, Err(CredentialError::DuplicateId(id)) if id == "k1"));
    }
}
