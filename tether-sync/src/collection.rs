//! Owned collections of entities.
//!
//! An [`EntityCollection`] lists the members of a parent (the cards of a
//! list, the items of a checklist). It is filled from nested payloads merged
//! through a [`DependencyMerge`] or from its own read request, always
//! resolving members through the identity cache.
//!
//! With consistency processing enabled the collection also follows the event
//! channel: deleted members are dropped, and members whose membership field
//! (e.g. `idList`) starts or stops pointing at the owner join or leave.

use crate::cache::StalenessClock;
use crate::context::{DependencyMerge, SharedOutcome};
use crate::entity::{Resolvable, Syncable};
use crate::env::SyncEnv;
use futures_util::future::FutureExt;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tether_core::{
    Document, EndpointParams, EntityId, EntityKey, EntityKind, Request, RequestKind, SyncError,
    TetherError, TetherResult, TransportError,
};
use tether_events::{EntityEvent, EventFilter, Subscription};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

struct CollectionInner<T> {
    env: SyncEnv,
    owner: EntityKey,
    source: RequestKind,
    items: RwLock<Vec<Arc<T>>>,
    clock: Mutex<StalenessClock>,
    /// The refresh currently running, shared by every caller.
    in_flight: Mutex<Option<SharedOutcome<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Members of one parent entity, in remote order.
pub struct EntityCollection<T: Resolvable> {
    inner: Arc<CollectionInner<T>>,
}

impl<T: Resolvable> Clone for EntityCollection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resolvable> EntityCollection<T> {
    /// Create an empty collection owned by `owner`, refreshed with `source`.
    pub fn new(env: &SyncEnv, owner: EntityKey, source: RequestKind) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                env: env.clone(),
                owner,
                source,
                items: RwLock::new(Vec::new()),
                clock: Mutex::new(StalenessClock::new(env.config().refresh_throttle)),
                in_flight: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn owner(&self) -> &EntityKey {
        &self.inner.owner
    }

    pub fn member_kind(&self) -> EntityKind {
        T::descriptor().kind()
    }

    pub fn items(&self) -> Vec<Arc<T>> {
        self.inner.read_items().clone()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.inner
            .read_items()
            .iter()
            .map(|item| item.id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read_items().is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.inner.read_items().iter().any(|item| item.id() == id)
    }

    pub fn get(&self, id: &EntityId) -> Option<Arc<T>> {
        self.inner
            .read_items()
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    /// Append a member unless already present.
    pub fn insert(&self, item: Arc<T>) -> bool {
        self.inner.insert(item)
    }

    pub fn remove(&self, id: &EntityId) -> Option<Arc<T>> {
        self.inner.remove(id)
    }

    /// Replace the members. Returns whether the membership or order changed.
    pub fn update(&self, items: Vec<Arc<T>>) -> bool {
        self.inner.update(items)
    }

    /// Merge a JSON array of member payloads, resolving each member through
    /// the identity cache, and replace the membership with it.
    pub fn merge_payload(&self, payload: &Value, overwrite: bool) -> TetherResult<bool> {
        self.inner.merge_payload(payload, overwrite)
    }

    /// The read request that lists the members remotely.
    pub fn refresh_request(&self) -> Request {
        let mut params = EndpointParams::new();
        params.insert("_id".to_string(), self.inner.owner.id.to_string());
        let endpoint = self.inner.env.endpoints().build(self.inner.source, params);
        let fields = T::descriptor().table.fields_parameter();
        let request = Request::new(endpoint);
        if fields.is_empty() {
            request
        } else {
            request.with_parameter("fields", fields)
        }
    }

    /// Fetch the member list, honoring the refresh throttle unless `force`.
    ///
    /// Concurrent callers share one request. A cancelled caller detaches
    /// without stopping the fetch.
    pub async fn refresh(&self, force: bool, cancel: &CancellationToken) -> TetherResult<()> {
        if cancel.is_cancelled() {
            return Err(self.inner.cancelled());
        }

        let outcome = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let running = in_flight
                .as_ref()
                .filter(|outcome| outcome.peek().is_none())
                .cloned();
            match running {
                Some(outcome) => {
                    trace!(owner = %self.inner.owner, "Joining in-flight collection refresh");
                    outcome
                }
                None => {
                    if !force {
                        let clock =
                            self.inner.clock.lock().unwrap_or_else(PoisonError::into_inner);
                        if !clock.is_expired(Instant::now()) {
                            trace!(owner = %self.inner.owner, "Collection refresh throttled");
                            return Ok(());
                        }
                    }
                    let outcome = self.spawn_fetch();
                    *in_flight = Some(outcome.clone());
                    outcome
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(owner = %self.inner.owner, "Caller detached from collection refresh");
                Err(self.inner.cancelled())
            }
            result = outcome => result,
        }
    }

    fn spawn_fetch(&self) -> SharedOutcome<()> {
        let collection = self.clone();
        let handle = tokio::spawn(async move {
            let result = collection.fetch().await;
            *collection
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
            result
        });
        let (kind, id) = (self.inner.owner.kind, self.inner.owner.id.clone());
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::TaskFailed {
                    kind,
                    id,
                    reason: e.to_string(),
                }
                .into()),
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch(&self) -> TetherResult<()> {
        let request = self.refresh_request();
        let env = &self.inner.env;
        let payload = match env.execute(&request).await {
            Ok(response) => response.payload.unwrap_or(Value::Array(Vec::new())),
            Err(error) if error.is_transport() && !env.config().throw_on_service_error => {
                warn!(owner = %self.inner.owner, error = %error, "Suppressed service error");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        self.merge_payload(&payload, false)?;
        self.inner
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .touch(Instant::now());
        Ok(())
    }

    /// A dependency merger feeding this collection from the owner's nested
    /// payload under `wire_key`.
    pub fn dependency(&self, wire_key: &'static str) -> Arc<dyn DependencyMerge> {
        Arc::new(CollectionMerge {
            wire_key,
            collection: self.clone(),
        })
    }

    /// Subscribe to the environment's events to keep the membership current.
    ///
    /// Does nothing unless consistency processing is enabled. `membership`
    /// is the member's wire key pointing at its owner, if it has one.
    pub fn enable_consistency(&self, membership: Option<&'static str>) -> TetherResult<()> {
        let env = &self.inner.env;
        if !env.config().enable_consistency_processing {
            return Ok(());
        }

        let kind = self.member_kind();
        let filter = EventFilter::for_kind(kind);
        let weak = Arc::downgrade(&self.inner);
        let membership_name = membership.map(|key| T::descriptor().table.name_for(key));

        let subscription = env.events().subscribe(filter, move |event: &EntityEvent| {
            let Some(inner) = Weak::upgrade(&weak) else {
                return Ok(());
            };
            match event {
                EntityEvent::Deleted { id, .. } => {
                    if inner.remove(id).is_some() {
                        debug!(owner = %inner.owner, member = %id, "Removed deleted member");
                    }
                }
                EntityEvent::Updated {
                    id, changed_fields, ..
                } => {
                    let (Some(wire_key), Some(name)) = (membership, membership_name) else {
                        return Ok(());
                    };
                    if !changed_fields.iter().any(|field| field == name) {
                        return Ok(());
                    }
                    let Some(member) = inner.env.cached::<T>(kind, id) else {
                        return Ok(());
                    };
                    let owner_id = inner.owner.id.as_str();
                    let belongs = member.context().value(wire_key).as_ref().and_then(Value::as_str)
                        == Some(owner_id);
                    if belongs {
                        if inner.insert(member) {
                            debug!(owner = %inner.owner, member = %id, "Member joined");
                        }
                    } else if inner.remove(id).is_some() {
                        debug!(owner = %inner.owner, member = %id, "Member left");
                    }
                }
            }
            Ok(())
        })?;

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
        Ok(())
    }
}

impl<T: Resolvable> CollectionInner<T> {
    fn cancelled(&self) -> TetherError {
        SyncError::Cancelled {
            kind: self.owner.kind,
            id: self.owner.id.clone(),
        }
        .into()
    }

    fn read_items(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_items(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, item: Arc<T>) -> bool {
        let mut items = self.write_items();
        if items.iter().any(|existing| existing.id() == item.id()) {
            return false;
        }
        items.push(item);
        true
    }

    fn remove(&self, id: &EntityId) -> Option<Arc<T>> {
        let mut items = self.write_items();
        let index = items.iter().position(|item| item.id() == id)?;
        Some(items.remove(index))
    }

    fn update(&self, new_items: Vec<Arc<T>>) -> bool {
        let mut items = self.write_items();
        let changed = items.len() != new_items.len()
            || items
                .iter()
                .zip(&new_items)
                .any(|(old, new)| old.id() != new.id());
        *items = new_items;
        changed
    }

    fn merge_payload(&self, payload: &Value, overwrite: bool) -> TetherResult<bool> {
        let entries = payload.as_array().ok_or_else(|| TransportError::MalformedResponse {
            request: self.source,
            reason: "expected a JSON array of members".to_string(),
        })?;

        // Members merge (and publish) before the item lock is taken.
        let mut members = Vec::with_capacity(entries.len());
        let mut member_changed = false;
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                warn!(owner = %self.owner, "Skipping member without an id");
                continue;
            };
            let member = T::resolve(&self.env, EntityId::from(id))?;
            let changed = if overwrite {
                match Document::from_value(entry.clone()) {
                    Some(document) => member.context().merge(&document, true),
                    None => Vec::new(),
                }
            } else {
                match member.apply(entry) {
                    Ok(changed) => changed,
                    Err(error) if member.context().is_deleted() => {
                        trace!(member = %member.key(), error = %error, "Skipping deleted member");
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            };
            member_changed |= !changed.is_empty();
            members.push(member);
        }

        let membership_changed = self.update(members);
        Ok(membership_changed || member_changed)
    }
}

impl<T: Resolvable> fmt::Debug for EntityCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCollection")
            .field("owner", &self.inner.owner)
            .field("member_kind", &self.member_kind())
            .field("len", &self.len())
            .finish()
    }
}

struct CollectionMerge<T: Resolvable> {
    wire_key: &'static str,
    collection: EntityCollection<T>,
}

impl<T: Resolvable> DependencyMerge for CollectionMerge<T> {
    fn wire_key(&self) -> &'static str {
        self.wire_key
    }

    fn merge(&self, value: &Value, overwrite: bool) -> bool {
        match self.collection.merge_payload(value, overwrite) {
            Ok(changed) => changed,
            Err(error) => {
                warn!(
                    owner = %self.collection.owner(),
                    field = self.wire_key,
                    error = %error,
                    "Nested collection merge failed"
                );
                false
            }
        }
    }
}
