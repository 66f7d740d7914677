//! Bounded, TTL'd in-process cache of operations known to be applied.
//!
//! Only positive ledger answers are cached: once an operation is durably
//! applied it stays applied, so a hit can skip the database round trip. A
//! miss always falls through to the ledger, which remains authoritative.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use uuid::Uuid;

use crate::config::DedupeCacheConfig;

type Key = (Uuid, Uuid);

pub struct OperationCache {
    entries: Mutex<LruCache<Key, Instant>>,
    ttl: Duration,
}

impl OperationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// `None` when the cache is disabled.
    pub fn from_config(config: &DedupeCacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.capacity, Duration::from_secs(config.ttl_seconds)))
    }

    pub fn contains(&self, tenant_id: Uuid, operation_id: Uuid) -> bool {
        let mut entries = self.lock();
        let key = (tenant_id, operation_id);
        match entries.get(&key) {
            Some(inserted) if inserted.elapsed() < self.ttl => true,
            Some(_) => {
                entries.pop(&key);
                false
            }
            None => false,
        }
    }

    pub fn remember(&self, tenant_id: Uuid, operation_id: Uuid) {
        self.lock().put((tenant_id, operation_id), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<Key, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl std::fmt::Debug for OperationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
