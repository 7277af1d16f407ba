//! Tether Sync - Local Entity Synchronization Engine
//!
//! Keeps in-memory entity instances consistent with a remote service:
//!
//! - a process-wide identity cache, so each `(kind, id)` has one instance
//! - lazily refreshed documents guarded by a staleness clock
//! - debounced, coalesced submission of local writes
//! - single-flight refresh, submit and delete per entity
//! - change and delete notifications through the environment's event channel
//!
//! Everything an entity needs is reached through a [`SyncEnv`]; there is no
//! global state.

pub mod batch;
pub mod cache;
pub mod collection;
pub mod context;
pub mod entity;
pub mod env;
pub mod field;
pub mod retry;
pub mod rules;

#[cfg(test)]
mod test_support;

pub use batch::BatchCoordinator;
pub use cache::{
    CacheStats, CachedEntity, ConcurrentCache, EntityCache, NullCache, ReadMode, StalenessClock,
};
pub use collection::EntityCollection;
pub use context::{DependencyMerge, EntityDescriptor, LifecycleState, SharedOutcome, SyncContext};
pub use entity::{Deletable, DeletableContext, Resolvable, Syncable};
pub use env::{SyncEnv, SyncEnvBuilder};
pub use field::Field;
pub use retry::{RetryPolicy, RetryPredicate};
pub use rules::{
    IdRule, NonEmptyString, NotNull, OldValueRequired, PositionRule, Range, Rule, RuleChain,
};
pub use tokio_util::sync::CancellationToken;
