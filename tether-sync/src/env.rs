//! Synchronization environment.
//!
//! A [`SyncEnv`] bundles everything entities share: configuration, identity
//! cache, event channel, transport, endpoint factory, retry policy and
//! (de)serializers. Tests build their own isolated environments; nothing
//! here is global.

use crate::batch::BatchCoordinator;
use crate::cache::{ConcurrentCache, EntityCache, NullCache};
use crate::entity::Syncable;
use crate::retry::{RetryPolicy, RetryPredicate};
use futures_util::future::join_all;
use std::any::Any;
use std::sync::Arc;
use tether_core::{
    DescriptorEndpointFactory, Deserializer, EndpointFactory, EntityId, EntityKey, EntityKind,
    JsonSerializer, Request, Response, Serializer, SyncConfig, SyncError, TetherResult, Transport,
};
use tether_events::EventChannel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct EnvInner {
    config: SyncConfig,
    cache: Arc<dyn EntityCache>,
    events: EventChannel,
    transport: Arc<dyn Transport>,
    endpoints: Arc<dyn EndpointFactory>,
    retry: RetryPolicy,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
    batch: Option<BatchCoordinator>,
}

/// Shared synchronization environment. Cloning shares the environment.
#[derive(Clone)]
pub struct SyncEnv {
    inner: Arc<EnvInner>,
}

impl SyncEnv {
    pub fn builder(transport: Arc<dyn Transport>) -> SyncEnvBuilder {
        SyncEnvBuilder::new(transport)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<dyn EntityCache> {
        &self.inner.cache
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn endpoints(&self) -> &Arc<dyn EndpointFactory> {
        &self.inner.endpoints
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.inner.serializer
    }

    pub fn deserializer(&self) -> &Arc<dyn Deserializer> {
        &self.inner.deserializer
    }

    pub fn batch(&self) -> Option<&BatchCoordinator> {
        self.inner.batch.as_ref()
    }

    /// Execute one request through the retry policy.
    pub async fn execute(&self, request: &Request) -> TetherResult<Response> {
        self.inner
            .retry
            .execute(self.inner.transport.as_ref(), request)
            .await
    }

    /// Return the shared instance for `(kind, id)`, constructing it with
    /// `factory` on first use.
    ///
    /// Fails with [`SyncError::TypeMismatch`] when the key is already bound
    /// to an instance of another type.
    pub fn resolve<T, F>(&self, kind: EntityKind, id: EntityId, factory: F) -> TetherResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let key = EntityKey::new(kind, id);
        let entity = self.inner.cache.get_or_create(
            key.clone(),
            Box::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>),
        );
        entity.downcast::<T>().map_err(|_| {
            SyncError::TypeMismatch {
                kind: key.kind,
                id: key.id,
            }
            .into()
        })
    }

    /// Look up a cached instance without constructing one.
    pub fn cached<T: Any + Send + Sync>(&self, kind: EntityKind, id: &EntityId) -> Option<Arc<T>> {
        self.inner
            .cache
            .get(&EntityKey::new(kind, id.clone()))
            .and_then(|entity| entity.downcast::<T>().ok())
    }

    /// Refresh several entities concurrently. Each entity keeps its own
    /// single-flight guarantee; results are returned in input order.
    pub async fn refresh_all(
        &self,
        entities: &[&dyn Syncable],
        force: bool,
        cancel: &CancellationToken,
    ) -> Vec<TetherResult<()>> {
        debug!(count = entities.len(), force = force, "Refreshing entities");
        join_all(entities.iter().map(|entity| async move {
            entity.refresh(force, cancel).await
        }))
        .await
    }

    /// Tear the environment down: closes the event channel and empties the
    /// identity cache so entity handles can be released.
    pub fn close(&self) {
        self.inner.events.close();
        self.inner.cache.clear();
        info!("Synchronization environment closed");
    }
}

impl std::fmt::Debug for SyncEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEnv")
            .field("config", &self.inner.config)
            .field("cached", &self.inner.cache.len())
            .field("events", &self.inner.events)
            .field("batching", &self.inner.batch.is_some())
            .finish()
    }
}

/// Builder for [`SyncEnv`].
pub struct SyncEnvBuilder {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    cache: Option<Arc<dyn EntityCache>>,
    endpoints: Arc<dyn EndpointFactory>,
    predicate: Option<RetryPredicate>,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
    batching: bool,
}

impl SyncEnvBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: SyncConfig::default(),
            cache: None,
            endpoints: Arc::new(DescriptorEndpointFactory),
            predicate: None,
            serializer: Arc::new(JsonSerializer),
            deserializer: Arc::new(JsonSerializer),
            batching: false,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Disable identity deduplication.
    pub fn without_cache(mut self) -> Self {
        self.cache = Some(Arc::new(NullCache::new()));
        self
    }

    pub fn with_endpoint_factory(mut self, endpoints: Arc<dyn EndpointFactory>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Replace the status-code retry predicate.
    pub fn with_retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    /// Coalesce first-time refreshes into batched requests.
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn build(self) -> TetherResult<SyncEnv> {
        self.config.validate()?;

        let mut retry = RetryPolicy::from_config(&self.config);
        if let Some(predicate) = self.predicate {
            retry = retry.with_predicate(predicate);
        }
        let batch = self.batching.then(|| {
            BatchCoordinator::new(
                Arc::clone(&self.transport),
                self.config.batch_window,
                self.config.batch_max_size,
                retry.clone(),
            )
        });

        debug!(config = ?self.config, batching = self.batching, "Building synchronization environment");
        Ok(SyncEnv {
            inner: Arc::new(EnvInner {
                events: EventChannel::new(self.config.event_buffer),
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(ConcurrentCache::new())),
                transport: self.transport,
                endpoints: self.endpoints,
                retry,
                serializer: self.serializer,
                deserializer: self.deserializer,
                batch,
                config: self.config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use tether_core::TetherError;

    #[derive(Debug)]
    struct Marker(u32);

    fn env() -> SyncEnv {
        SyncEnv::builder(Arc::new(ScriptedTransport::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_returns_shared_instance() {
        let env = env();
        let a = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || Marker(1))
            .unwrap();
        let b = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || Marker(2))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.0, 1);
        assert_eq!(env.cache().stats().misses, 1);
    }

    #[test]
    fn test_resolve_type_mismatch() {
        let env = env();
        env.resolve(EntityKind::Card, EntityId::from("c1"), || Marker(1))
            .unwrap();

        let err = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || "other".to_string())
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Sync(SyncError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_without_cache_never_deduplicates() {
        let env = SyncEnv::builder(Arc::new(ScriptedTransport::new()))
            .without_cache()
            .build()
            .unwrap();
        let a = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || Marker(1))
            .unwrap();
        let b = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || Marker(2))
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!env.cache().is_deduplicating());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = SyncEnv::builder(Arc::new(ScriptedTransport::new()))
            .with_config(SyncConfig::default().with_retry_status_codes([42]))
            .build();
        assert!(matches!(result, Err(TetherError::Config(_))));
    }

    #[test]
    fn test_close_clears_cache_and_events() {
        let env = env();
        env.resolve(EntityKind::Card, EntityId::from("c1"), || Marker(1))
            .unwrap();
        env.close();

        assert!(env.cache().is_empty());
        assert!(env.events().is_closed());
    }
}
