//! Identity cache and staleness contracts.
//!
//! The identity cache guarantees that every (kind, id) pair maps to exactly
//! one shared entity instance, so a write through one handle is visible
//! through every other handle. Staleness is explicit: callers choose a
//! [`ReadMode`] and each context owns a [`StalenessClock`].

mod concurrent;
mod freshness;
mod null;
mod traits;

pub use concurrent::ConcurrentCache;
pub use freshness::{ReadMode, StalenessClock};
pub use null::NullCache;
pub use traits::{CacheStats, CachedEntity, EntityCache};
