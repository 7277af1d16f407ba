//! Identity cache trait and statistics.

use std::any::Any;
use std::sync::Arc;
use tether_core::EntityKey;

/// Type-erased shared entity instance as stored in the identity cache.
pub type CachedEntity = Arc<dyn Any + Send + Sync>;

/// Process-wide map from (kind, id) to the single shared entity instance.
///
/// Implementations must be safe under concurrent access and must construct
/// at most one instance per key: two concurrent `get_or_create` calls for the
/// same key observe the same instance and only one factory runs.
///
/// # Re-entrancy
///
/// The factory may run while the implementation holds internal locks, so it
/// must not call back into the cache.
pub trait EntityCache: Send + Sync {
    /// Look up an existing instance without creating one.
    fn get(&self, key: &EntityKey) -> Option<CachedEntity>;

    /// Atomic compare-and-insert.
    fn get_or_create(
        &self,
        key: EntityKey,
        factory: Box<dyn FnOnce() -> CachedEntity + '_>,
    ) -> CachedEntity;

    /// Evict an instance. Returns the evicted instance, if any.
    fn remove(&self, key: &EntityKey) -> Option<CachedEntity>;

    /// Evict everything.
    fn clear(&self);

    /// Number of cached instances.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether instances are deduplicated at all.
    fn is_deduplicating(&self) -> bool {
        true
    }

    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an existing instance.
    pub hits: u64,
    /// Lookups that constructed a new instance.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of explicit evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Share of lookups served by an existing instance. Zero before the
    /// first lookup.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }
}
