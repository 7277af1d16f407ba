//! Capabilities shared by every synchronized entity.

use crate::context::{EntityDescriptor, LifecycleState, SyncContext};
use crate::env::SyncEnv;
use async_trait::async_trait;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use tether_core::{EntityId, EntityKey, Request, RequestKind, SyncError, TetherResult};
use tokio_util::sync::CancellationToken;

/// An entity backed by a [`SyncContext`].
#[async_trait]
pub trait Syncable: Send + Sync + 'static {
    fn context(&self) -> &SyncContext;

    fn key(&self) -> &EntityKey {
        self.context().key()
    }

    fn id(&self) -> &EntityId {
        self.context().id()
    }

    fn state(&self) -> LifecycleState {
        self.context().state()
    }

    /// Bring the entity up to date, honoring the refresh throttle unless
    /// `force` is set.
    async fn refresh(&self, force: bool, cancel: &CancellationToken) -> TetherResult<()> {
        self.context().synchronize(force, cancel).await.map(|_| ())
    }

    /// The read request a refresh would issue, for external batching.
    fn refresh_request(&self) -> Request {
        self.context().refresh_request()
    }

    /// Merge this entity's slice of an externally batched response.
    fn apply(&self, payload: &Value) -> TetherResult<Vec<String>> {
        self.context().apply(payload)
    }

    /// Submit pending local changes now.
    async fn flush(&self, cancel: &CancellationToken) -> TetherResult<()> {
        self.context().flush(cancel).await
    }
}

/// An entity kind that can be looked up by id through the identity cache.
pub trait Resolvable: Syncable + Sized {
    fn descriptor() -> &'static EntityDescriptor;

    /// The shared instance for `id` in `env`.
    fn resolve(env: &SyncEnv, id: EntityId) -> TetherResult<Arc<Self>>;
}

/// A [`SyncContext`] whose kind supports remote deletion.
#[derive(Debug, Clone)]
pub struct DeletableContext {
    context: SyncContext,
    delete: RequestKind,
}

impl DeletableContext {
    pub fn new(context: SyncContext) -> TetherResult<Self> {
        let delete = context.descriptor().delete.ok_or(SyncError::NotDeletable {
            kind: context.kind(),
        })?;
        Ok(Self::for_kind(context, delete))
    }

    /// Use `delete` as the delete request regardless of the descriptor.
    pub fn for_kind(context: SyncContext, delete: RequestKind) -> Self {
        Self { context, delete }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn delete_kind(&self) -> RequestKind {
        self.delete
    }

    /// Delete the entity remotely. Concurrent calls share one request;
    /// deleting an already deleted entity succeeds without I/O.
    pub async fn delete(&self, cancel: &CancellationToken) -> TetherResult<()> {
        self.context.delete_with(self.delete, cancel).await
    }

    pub fn delete_request(&self) -> Request {
        self.context.delete_request(self.delete)
    }
}

impl Deref for DeletableContext {
    type Target = SyncContext;

    fn deref(&self) -> &SyncContext {
        &self.context
    }
}

/// An entity that can be deleted remotely.
#[async_trait]
pub trait Deletable: Syncable {
    fn deletable(&self) -> &DeletableContext;

    async fn delete(&self, cancel: &CancellationToken) -> TetherResult<()> {
        self.deletable().delete(cancel).await
    }

    fn is_deleted(&self) -> bool {
        self.context().is_deleted()
    }
}
