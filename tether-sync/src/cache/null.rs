//! Pass-through cache that never deduplicates.

use super::traits::{CacheStats, CachedEntity, EntityCache};
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::EntityKey;

/// Every lookup constructs a fresh instance. Nothing is retained.
#[derive(Debug, Default)]
pub struct NullCache {
    misses: AtomicU64,
}

impl NullCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityCache for NullCache {
    fn get(&self, _key: &EntityKey) -> Option<CachedEntity> {
        None
    }

    fn get_or_create(
        &self,
        _key: EntityKey,
        factory: Box<dyn FnOnce() -> CachedEntity + '_>,
    ) -> CachedEntity {
        self.misses.fetch_add(1, Ordering::Relaxed);
        factory()
    }

    fn remove(&self, _key: &EntityKey) -> Option<CachedEntity> {
        None
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }

    fn is_deduplicating(&self) -> bool {
        false
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
