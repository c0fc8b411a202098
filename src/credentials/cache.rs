//! TTL cache for resolved credentials.

use super::CredentialRecord;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

struct CacheEntry {
    record: CredentialRecord,
    inserted: Instant,
}

/// Read-mostly cache of credential records.
///
/// Lookups take the read lock only; the write lock is held for a single
/// insert or eviction and never across I/O. Ids the key service reported
/// as unknown are remembered separately for `negative_ttl`.
pub struct CredentialCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    misses: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    negative_ttl: Duration,
}

impl CredentialCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            misses: RwLock::new(HashMap::new()),
            ttl,
            negative_ttl: Duration::ZERO,
        }
    }

    /// Remember unknown ids for `negative_ttl`. Zero disables it.
    pub fn with_negative_ttl(mut self, negative_ttl: Duration) -> Self {
        self.negative_ttl = negative_ttl;
        self
    }

    /// Return a fresh cached record, if any.
    pub fn get(&self, id: &str) -> Option<CredentialRecord> {
        self.get_at(id, Instant::now())
    }

    fn get_at(&self, id: &str, now: Instant) -> Option<CredentialRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(id)?;
        if now.duration_since(entry.inserted) >= self.ttl {
            trace!(key_id = %id, "Credential cache entry stale");
            return None;
        }
        Some(entry.record.clone())
    }

    /// Insert or replace a record, dropping stale entries on the way.
    pub fn insert(&self, record: CredentialRecord) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| now.duration_since(entry.inserted) < self.ttl);
        entries.insert(
            record.id().to_string(),
            CacheEntry {
                record,
                inserted: now,
            },
        );
    }

    /// Whether `id` was recently reported unknown.
    pub fn is_known_missing(&self, id: &str) -> bool {
        self.is_known_missing_at(id, Instant::now())
    }

    fn is_known_missing_at(&self, id: &str, now: Instant) -> bool {
        let misses = self.misses.read().unwrap_or_else(PoisonError::into_inner);
        misses
            .get(id)
            .is_some_and(|inserted| now.duration_since(*inserted) < self.negative_ttl)
    }

    /// Record that `id` is unknown to the key service.
    pub fn insert_missing(&self, id: &str) {
        if self.negative_ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut misses = self.misses.write().unwrap_or_else(PoisonError::into_inner);
        misses.retain(|_, inserted| now.duration_since(*inserted) < self.negative_ttl);
        misses.insert(id.to_string(), now);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.misses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
