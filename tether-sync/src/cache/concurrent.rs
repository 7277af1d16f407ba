//! DashMap-backed identity cache.

use super::traits::{CacheStats, CachedEntity, EntityCache};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::EntityKey;

/// Default identity cache: one shared instance per key for the lifetime of
/// the environment, or until evicted.
#[derive(Default)]
pub struct ConcurrentCache {
    entries: DashMap<EntityKey, CachedEntity>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ConcurrentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityCache for ConcurrentCache {
    fn get(&self, key: &EntityKey) -> Option<CachedEntity> {
        let found = self.entries.get(key).map(|entry| entry.value().clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn get_or_create(
        &self,
        key: EntityKey,
        factory: Box<dyn FnOnce() -> CachedEntity + '_>,
    ) -> CachedEntity {
        // The entry API holds the shard lock across check and insert.
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %vacant.key(), "Identity cache miss");
                vacant.insert(factory()).value().clone()
            }
        }
    }

    fn remove(&self, key: &EntityKey) -> Option<CachedEntity> {
        let removed = self.entries.remove(key).map(|(_, entity)| entity);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Evicted entity from identity cache");
        }
        removed
    }

    fn clear(&self) {
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConcurrentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentCache")
            .field("stats", &self.stats())
            .finish()
    }
}
