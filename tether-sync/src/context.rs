//! Per-entity synchronization controller.
//!
//! A [`SyncContext`] owns the authoritative local [`Document`] of one entity,
//! the set of pending (locally written, not yet submitted) fields, the
//! debounce deadline for outgoing writes and the staleness clock for
//! incoming refreshes.
//!
//! # Single flight
//!
//! At most one refresh, one submit and one delete run per entity. Each runs
//! as a spawned task behind a shared future; late callers await the same
//! outcome. Cancelling a caller's token detaches that caller only.
//!
//! # Locking
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! await point, while dependency mergers run, or while events are published.

use crate::cache::{ReadMode, StalenessClock};
use crate::env::SyncEnv;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tether_core::{
    Document, Endpoint, EndpointParams, EntityId, EntityKey, EntityKind, FieldTable, Request,
    RequestKind, SyncError, TetherError, TetherResult, TransportError,
};
use tether_events::EntityEvent;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outcome of a single-flight operation shared by every awaiting caller.
pub type SharedOutcome<T> = Shared<BoxFuture<'static, TetherResult<T>>>;

/// Static description of one entity kind: its fields and the requests used
/// to refresh, update and delete it.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub table: FieldTable,
    pub refresh: RequestKind,
    pub update: RequestKind,
    pub delete: Option<RequestKind>,
    /// Extra query parameters sent with every refresh (nested expansions).
    pub refresh_parameters: &'static [(&'static str, &'static str)],
}

impl EntityDescriptor {
    pub fn kind(&self) -> EntityKind {
        self.table.kind()
    }
}

/// Lifecycle state derived from the context's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Known by id only, never fetched.
    Stub,
    /// A refresh is in flight.
    Synchronizing,
    Synchronized,
    /// Local writes wait for submission.
    Dirty,
    /// A submit is in flight.
    Submitting,
    /// Terminal.
    Deleted,
}

/// Merges a nested collection or owned sub-entity carried under one wire key.
///
/// Registered explicitly per field. Returns whether the dependent state
/// changed; the context then reports the field as changed.
pub trait DependencyMerge: Send + Sync {
    fn wire_key(&self) -> &'static str;

    fn merge(&self, value: &Value, overwrite: bool) -> bool;
}

#[derive(Debug, Clone)]
struct PendingChange {
    value: Value,
    /// Monotonic write counter. Distinguishes a field rewritten after a
    /// submit snapshot from the snapshotted write.
    version: u64,
}

struct ContextState {
    document: Document,
    pending: HashMap<String, PendingChange>,
    next_version: u64,
    clock: StalenessClock,
    synchronized: bool,
    refresh: Option<SharedOutcome<Document>>,
    submit: Option<SharedOutcome<()>>,
    debounce_deadline: Option<Instant>,
    timer_armed: bool,
    delete: Option<SharedOutcome<()>>,
    deleted: bool,
}

impl ContextState {
    fn lifecycle(&self) -> LifecycleState {
        if self.deleted {
            LifecycleState::Deleted
        } else if self.submit.is_some() {
            LifecycleState::Submitting
        } else if self.refresh.is_some() {
            LifecycleState::Synchronizing
        } else if !self.pending.is_empty() {
            LifecycleState::Dirty
        } else if !self.synchronized {
            LifecycleState::Stub
        } else {
            LifecycleState::Synchronized
        }
    }

    /// Assign incoming fields. Pending fields win unless `overwrite`, in
    /// which case the pending entry is discarded. Returns the wire keys whose
    /// value actually changed.
    fn merge_fields(
        &mut self,
        incoming: &Document,
        overwrite: bool,
        skip: &HashSet<&'static str>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in incoming.iter() {
            if skip.contains(key) {
                continue;
            }
            if self.pending.contains_key(key) {
                if !overwrite {
                    continue;
                }
                self.pending.remove(key);
            }
            if self.document.get(key) != Some(value) {
                self.document.insert(key, value.clone());
                changed.push(key.to_string());
            }
        }
        changed
    }
}

struct ContextShared {
    key: EntityKey,
    descriptor: &'static EntityDescriptor,
    env: SyncEnv,
    state: Mutex<ContextState>,
    dependencies: RwLock<Vec<Arc<dyn DependencyMerge>>>,
}

/// Handle to one entity's synchronization state. Cloning shares the state.
#[derive(Clone)]
pub struct SyncContext {
    shared: Arc<ContextShared>,
}

impl SyncContext {
    /// Create a context in the `Stub` state.
    pub fn new(env: &SyncEnv, descriptor: &'static EntityDescriptor, id: impl Into<EntityId>) -> Self {
        let key = EntityKey::new(descriptor.kind(), id);
        let mut document = Document::new();
        document.insert("id", Value::String(key.id.to_string()));

        Self {
            shared: Arc::new(ContextShared {
                key,
                descriptor,
                env: env.clone(),
                state: Mutex::new(ContextState {
                    document,
                    pending: HashMap::new(),
                    next_version: 0,
                    clock: StalenessClock::new(env.config().refresh_throttle),
                    synchronized: false,
                    refresh: None,
                    submit: None,
                    debounce_deadline: None,
                    timer_armed: false,
                    delete: None,
                    deleted: false,
                }),
                dependencies: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.shared.key
    }

    pub fn id(&self) -> &EntityId {
        &self.shared.key.id
    }

    pub fn kind(&self) -> EntityKind {
        self.shared.key.kind
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.shared.descriptor
    }

    pub fn env(&self) -> &SyncEnv {
        &self.shared.env
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().lifecycle()
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn is_dirty(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Wire keys with pending local changes, sorted.
    pub fn pending_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.lock().pending.keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Snapshot of the local document, including pending writes.
    pub fn document(&self) -> Document {
        self.lock().document.clone()
    }

    /// Age of the local copy, `None` if never refreshed.
    pub fn staleness(&self) -> Option<Duration> {
        self.lock().clock.staleness(Instant::now())
    }

    pub fn value(&self, wire_key: &str) -> Option<Value> {
        self.lock().document.get(wire_key).cloned()
    }

    /// Decode one field of the local document. No I/O.
    pub fn read_field<T: DeserializeOwned>(&self, wire_key: &str) -> TetherResult<Option<T>> {
        self.lock().document.get_as(wire_key).map_err(|e| {
            TransportError::MalformedResponse {
                request: self.shared.descriptor.refresh,
                reason: format!("{wire_key}: {e}"),
            }
            .into()
        })
    }

    pub fn register_dependency(&self, merger: Arc<dyn DependencyMerge>) {
        self.shared
            .dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(merger);
    }

    fn endpoint(&self, kind: RequestKind) -> Endpoint {
        let mut params = EndpointParams::new();
        params.insert("_id".to_string(), self.id().to_string());
        self.env().endpoints().build(kind, params)
    }

    /// The read request this context issues to refresh itself.
    pub fn refresh_request(&self) -> Request {
        let descriptor = self.shared.descriptor;
        let mut request = Request::new(self.endpoint(descriptor.refresh));
        let fields = descriptor.table.fields_parameter();
        if !fields.is_empty() {
            request = request.with_parameter("fields", fields);
        }
        for (key, value) in descriptor.refresh_parameters {
            request = request.with_parameter(*key, *value);
        }
        request
    }

    pub(crate) fn delete_request(&self, kind: RequestKind) -> Request {
        Request::new(self.endpoint(kind))
    }

    fn cancelled_error(&self) -> TetherError {
        SyncError::Cancelled {
            kind: self.kind(),
            id: self.id().clone(),
        }
        .into()
    }

    fn deleted_error(&self) -> TetherError {
        SyncError::Deleted {
            kind: self.kind(),
            id: self.id().clone(),
        }
        .into()
    }

    fn decode(&self, request: RequestKind, payload: Option<Value>) -> TetherResult<Document> {
        match payload {
            None | Some(Value::Null) => Ok(Document::new()),
            Some(value) => Document::from_value(value).ok_or_else(|| {
                TransportError::MalformedResponse {
                    request,
                    reason: "expected a JSON object".to_string(),
                }
                .into()
            }),
        }
    }

    /// Terminal transport failures are swallowed when the environment is
    /// configured not to surface service errors.
    fn absorb_failure(&self, error: TetherError, operation: &'static str) -> TetherResult<()> {
        if error.is_transport() && !self.env().config().throw_on_service_error {
            warn!(
                key = %self.key(),
                operation = operation,
                error = %error,
                "Suppressed service error"
            );
            Ok(())
        } else {
            Err(error)
        }
    }

    fn spawn_shared<T, F>(&self, task: F) -> SharedOutcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = TetherResult<T>> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let kind = self.kind();
        let id = self.id().clone();
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

    async fn await_detachable<T: Clone>(
        &self,
        outcome: SharedOutcome<T>,
        cancel: &CancellationToken,
    ) -> TetherResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %self.key(), "Caller detached from in-flight operation");
                Err(self.cancelled_error())
            }
            result = outcome => result,
        }
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    fn merge_dependencies(&self, incoming: &Document, overwrite: bool) -> (HashSet<&'static str>, Vec<String>) {
        let dependencies: Vec<Arc<dyn DependencyMerge>> = self
            .shared
            .dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let table = &self.shared.descriptor.table;
        let mut handled = HashSet::new();
        let mut changed = Vec::new();
        for dependency in dependencies {
            let wire_key = dependency.wire_key();
            handled.insert(wire_key);
            if let Some(value) = incoming.get(wire_key) {
                if dependency.merge(value, overwrite) {
                    changed.push(table.name_for(wire_key).to_string());
                }
            }
        }
        (handled, changed)
    }

    /// Merge `incoming`, running `prepare` under the state lock first. When
    /// `prepare` returns false nothing is merged and `None` is returned.
    /// Publishes nothing.
    fn merge_quiet<F>(&self, incoming: &Document, overwrite: bool, prepare: F) -> Option<Vec<String>>
    where
        F: FnOnce(&mut ContextState) -> bool,
    {
        if self.is_deleted() {
            let mut state = self.lock();
            let _ = prepare(&mut *state);
            return None;
        }

        let (handled, mut changed) = self.merge_dependencies(incoming, overwrite);
        let table = &self.shared.descriptor.table;
        let mut state = self.lock();
        if !prepare(&mut *state) {
            return None;
        }
        changed.extend(
            state
                .merge_fields(incoming, overwrite, &handled)
                .iter()
                .map(|key| table.name_for(key).to_string()),
        );
        Some(changed)
    }

    fn publish_changed(&self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        trace!(key = %self.key(), changed = ?changed, "Merged fields");
        self.env().events().publish(EntityEvent::updated(
            self.kind(),
            self.id().clone(),
            changed.to_vec(),
        ));
    }

    fn merge_with<F>(&self, incoming: &Document, overwrite: bool, prepare: F) -> Vec<String>
    where
        F: FnOnce(&mut ContextState) -> bool,
    {
        let changed = self
            .merge_quiet(incoming, overwrite, prepare)
            .unwrap_or_default();
        self.publish_changed(&changed);
        changed
    }

    /// Merge an incoming document. Pending fields are kept unless
    /// `overwrite`. Returns the property names that changed and publishes
    /// `Updated` when any did.
    pub fn merge(&self, incoming: &Document, overwrite: bool) -> Vec<String> {
        self.merge_with(incoming, overwrite, |state| !state.deleted)
    }

    /// Merge this entity's slice of a multi-entity response as if it had
    /// been refreshed.
    pub fn apply(&self, payload: &Value) -> TetherResult<Vec<String>> {
        let incoming = self.decode(self.shared.descriptor.refresh, Some(payload.clone()))?;
        if self.is_deleted() {
            return Err(self.deleted_error());
        }
        Ok(self.merge_with(&incoming, false, |state| {
            state.clock.touch(Instant::now());
            state.synchronized = true;
            !state.deleted
        }))
    }

    /// Decode raw bytes with the environment's deserializer and apply them.
    pub fn apply_raw(&self, bytes: &[u8]) -> TetherResult<Vec<String>> {
        let value = self.env().deserializer().deserialize(bytes)?;
        self.apply(&value)
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Bring the local document up to date.
    ///
    /// Attaches to an in-flight refresh if there is one. Otherwise, unless
    /// `force` is set, a document refreshed within the throttle window is
    /// returned as is.
    pub async fn synchronize(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> TetherResult<Document> {
        self.read(ReadMode::from_force(force), cancel).await
    }

    /// Same as [`SyncContext::synchronize`] with an explicit read mode.
    pub async fn read(&self, mode: ReadMode, cancel: &CancellationToken) -> TetherResult<Document> {
        if cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let outcome = {
            let mut state = self.lock();
            if state.deleted {
                return Err(self.deleted_error());
            }
            if mode == ReadMode::CacheOnly {
                return Ok(state.document.clone());
            }
            match state.refresh.clone() {
                Some(in_flight) => in_flight,
                None => {
                    if !mode.requires_refresh(&state.clock, Instant::now()) {
                        trace!(key = %self.key(), "Refresh throttled");
                        return Ok(state.document.clone());
                    }
                    let stub = !state.synchronized;
                    let ctx = self.clone();
                    let outcome = self.spawn_shared(async move { ctx.run_refresh(stub).await });
                    state.refresh = Some(outcome.clone());
                    outcome
                }
            }
        };

        self.await_detachable(outcome, cancel).await
    }

    async fn run_refresh(&self, stub: bool) -> TetherResult<Document> {
        let request = self.refresh_request();
        let kind = request.kind();
        debug!(key = %self.key(), request = %kind, stub = stub, "Refreshing entity");

        let response = match self.env().batch() {
            Some(batch) if stub => batch.fetch(request).await,
            _ => self.env().execute(&request).await,
        };
        let incoming = response.and_then(|r| self.decode(kind, r.payload));

        match incoming {
            Ok(incoming) => {
                self.merge_with(&incoming, false, |state| {
                    state.refresh = None;
                    if state.deleted {
                        return false;
                    }
                    state.clock.touch(Instant::now());
                    state.synchronized = true;
                    true
                });
                if self.is_deleted() {
                    return Err(self.deleted_error());
                }
                Ok(self.document())
            }
            Err(error) => {
                self.lock().refresh = None;
                self.absorb_failure(error, "refresh")?;
                Ok(self.document())
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes and submission
    // ------------------------------------------------------------------

    /// Record a local write. Never performs I/O.
    ///
    /// Writing the current value is a no-op. Otherwise the value is applied
    /// to the local document, added to the pending set and the debounce
    /// timer is (re)armed. Without a tokio runtime the change stays pending
    /// until [`SyncContext::flush`].
    pub fn write(&self, wire_key: &str, value: Value) -> TetherResult<()> {
        let mut state = self.lock();
        if state.deleted {
            return Err(self.deleted_error());
        }

        let unchanged = match state.document.get(wire_key) {
            Some(current) => current == &value,
            None => value.is_null(),
        };
        if unchanged {
            return Ok(());
        }

        state.document.insert(wire_key, value.clone());
        state.next_version += 1;
        let version = state.next_version;
        state
            .pending
            .insert(wire_key.to_string(), PendingChange { value, version });
        self.arm_debounce(&mut state);
        Ok(())
    }

    fn arm_debounce(&self, state: &mut ContextState) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!(key = %self.key(), "No runtime, change stays pending until flush");
            return;
        };

        state.debounce_deadline =
            Some(Instant::now() + self.env().config().change_submission_time);
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        let ctx = self.clone();
        handle.spawn(async move { ctx.run_debounce().await });
    }

    async fn run_debounce(self) {
        loop {
            let deadline = {
                let mut state = self.lock();
                match state.debounce_deadline {
                    Some(deadline) if !state.deleted => deadline,
                    _ => {
                        state.timer_armed = false;
                        state.debounce_deadline = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(deadline).await;

            let (outcome, started) = {
                let mut state = self.lock();
                match state.debounce_deadline {
                    Some(deadline) if !state.deleted && deadline > Instant::now() => {
                        // Re-armed while sleeping.
                        continue;
                    }
                    Some(_) if !state.deleted => {}
                    // Flushed or deleted while sleeping.
                    _ => {
                        state.timer_armed = false;
                        state.debounce_deadline = None;
                        return;
                    }
                }
                match state.submit.clone() {
                    // Writes made during an in-flight submit go out after it.
                    Some(in_flight) => (in_flight, false),
                    None => {
                        state.debounce_deadline = None;
                        state.timer_armed = false;
                        if state.pending.is_empty() {
                            return;
                        }
                        (self.start_submit(&mut state), true)
                    }
                }
            };

            // The submit task reports its own failure.
            let _ = outcome.await;
            if started {
                return;
            }
        }
    }

    fn start_submit(&self, state: &mut ContextState) -> SharedOutcome<()> {
        let snapshot: Vec<(String, u64)> = state
            .pending
            .iter()
            .map(|(key, change)| (key.clone(), change.version))
            .collect();
        let payload: Document = state
            .pending
            .iter()
            .map(|(key, change)| (key.clone(), change.value.clone()))
            .collect();

        let ctx = self.clone();
        let outcome = self.spawn_shared(async move { ctx.run_submit(payload, snapshot).await });
        state.submit = Some(outcome.clone());
        outcome
    }

    async fn run_submit(&self, payload: Document, snapshot: Vec<(String, u64)>) -> TetherResult<()> {
        let update = self.shared.descriptor.update;
        debug!(
            key = %self.key(),
            request = %update,
            fields = snapshot.len(),
            "Submitting pending changes"
        );

        let result = match self.env().serializer().serialize(&payload) {
            Ok(body) => {
                let request = Request::new(self.endpoint(update))
                    .with_payload(payload)
                    .with_body(body);
                self.env().execute(&request).await
            }
            Err(e) => Err(e),
        };
        let incoming = result.and_then(|r| self.decode(update, r.payload));

        match incoming {
            Ok(incoming) => {
                // Fields rewritten after the snapshot stay pending and keep
                // their newer local value.
                let merged = self.merge_quiet(&incoming, false, |state| {
                    state.submit = None;
                    if state.deleted {
                        return false;
                    }
                    for (key, version) in &snapshot {
                        if state.pending.get(key).map(|c| c.version) == Some(*version) {
                            state.pending.remove(key);
                        }
                    }
                    true
                });
                // Submitted values were already in the document, so the
                // response alone rarely reports them as changed.
                if let Some(mut changed) = merged {
                    let table = &self.shared.descriptor.table;
                    for (key, _) in &snapshot {
                        let name = table.name_for(key);
                        if !changed.iter().any(|c| c == name) {
                            changed.push(name.to_string());
                        }
                    }
                    self.publish_changed(&changed);
                }
                Ok(())
            }
            Err(error) => {
                self.lock().submit = None;
                if !error.is_transport() || self.env().config().throw_on_service_error {
                    warn!(key = %self.key(), error = %error, "Submit failed, fields stay dirty");
                }
                self.absorb_failure(error, "submit")
            }
        }
    }

    /// Submit pending changes now and wait for the outcome.
    ///
    /// Attaches to an in-flight submit first; writes made meanwhile are
    /// submitted afterwards.
    pub async fn flush(&self, cancel: &CancellationToken) -> TetherResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled_error());
            }

            let (outcome, attached) = {
                let mut state = self.lock();
                if state.deleted {
                    return Err(self.deleted_error());
                }
                match state.submit.clone() {
                    Some(in_flight) => (in_flight, true),
                    None => {
                        if state.pending.is_empty() {
                            return Ok(());
                        }
                        state.debounce_deadline = None;
                        (self.start_submit(&mut state), false)
                    }
                }
            };

            self.await_detachable(outcome, cancel).await?;
            if !attached {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    pub(crate) async fn delete_with(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> TetherResult<()> {
        if cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let outcome = {
            let mut state = self.lock();
            if state.deleted {
                return Ok(());
            }
            match state.delete.clone() {
                Some(in_flight) => in_flight,
                None => {
                    let ctx = self.clone();
                    let outcome = self.spawn_shared(async move { ctx.run_delete(kind).await });
                    state.delete = Some(outcome.clone());
                    outcome
                }
            }
        };

        self.await_detachable(outcome, cancel).await
    }

    async fn run_delete(&self, kind: RequestKind) -> TetherResult<()> {
        debug!(key = %self.key(), request = %kind, "Deleting entity");
        let request = self.delete_request(kind);

        match self.env().execute(&request).await {
            Ok(_) => {
                {
                    let mut state = self.lock();
                    state.delete = None;
                    state.deleted = true;
                    state.pending.clear();
                    state.debounce_deadline = None;
                }
                self.env()
                    .events()
                    .publish(EntityEvent::deleted(self.kind(), self.id().clone()));
                if self.env().config().remove_deleted_items_from_cache {
                    self.env().cache().remove(self.key());
                }
                Ok(())
            }
            Err(error) => {
                self.lock().delete = None;
                self.absorb_failure(error, "delete")
            }
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("key", self.key())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DeletableContext;
    use crate::test_support::ScriptedTransport;
    use serde_json::json;
    use tether_core::{FieldDescriptor, Response, SyncConfig, TetherError};
    use tether_events::{EventFilter, EventType};
    use tokio::time::sleep;

    const FIELDS: &[FieldDescriptor] = &[
        FieldDescriptor::new("Name", "name"),
        FieldDescriptor::new("Description", "desc"),
        FieldDescriptor::new("Position", "pos"),
    ];

    static CARD: EntityDescriptor = EntityDescriptor {
        table: FieldTable::new(EntityKind::Card, FIELDS),
        refresh: RequestKind::CardReadRefresh,
        update: RequestKind::CardWriteUpdate,
        delete: Some(RequestKind::CardWriteDelete),
        refresh_parameters: &[("checklists", "all")],
    };

    static LIST: EntityDescriptor = EntityDescriptor {
        table: FieldTable::new(EntityKind::List, FIELDS),
        refresh: RequestKind::ListReadRefresh,
        update: RequestKind::ListWriteUpdate,
        delete: None,
        refresh_parameters: &[],
    };

    fn setup_with(config: SyncConfig) -> (SyncEnv, Arc<ScriptedTransport>, SyncContext) {
        let transport = Arc::new(ScriptedTransport::new());
        let env = SyncEnv::builder(transport.clone())
            .with_config(config)
            .build()
            .unwrap();
        let ctx = SyncContext::new(&env, &CARD, "c1");
        (env, transport, ctx)
    }

    fn setup() -> (SyncEnv, Arc<ScriptedTransport>, SyncContext) {
        setup_with(SyncConfig::default())
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_new_context_is_stub() {
        let (_env, _transport, ctx) = setup();
        assert_eq!(ctx.state(), LifecycleState::Stub);
        assert_eq!(ctx.document().id(), Some("c1"));
        assert!(ctx.staleness().is_none());
    }

    #[test]
    fn test_refresh_request_carries_fields_and_expansions() {
        let (_env, _transport, ctx) = setup();
        let request = ctx.refresh_request();
        assert_eq!(request.kind(), RequestKind::CardReadRefresh);
        assert_eq!(request.param("_id"), Some("c1"));
        assert_eq!(request.parameters["fields"], "name,desc,pos");
        assert_eq!(request.parameters["checklists"], "all");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_synchronize_is_single_flight() {
        let (_env, transport, ctx) = setup();
        transport.set_delay(Duration::from_millis(50));
        transport.push(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "Fetched"})),
        );
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            ctx.synchronize(false, &cancel),
            ctx.synchronize(false, &cancel),
            ctx.synchronize(true, &cancel),
        );

        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 1);
        for result in [a, b, c] {
            assert_eq!(result.unwrap().get("name"), Some(&json!("Fetched")));
        }
        assert_eq!(ctx.state(), LifecycleState::Synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_and_read_modes() {
        let (_env, transport, ctx) = setup();
        let cancel = CancellationToken::new();

        ctx.read(ReadMode::CacheOnly, &cancel).await.unwrap();
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 0);

        ctx.synchronize(false, &cancel).await.unwrap();
        ctx.synchronize(false, &cancel).await.unwrap();
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 1);

        ctx.read(ReadMode::Force, &cancel).await.unwrap();
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 2);

        sleep(tether_core::DEFAULT_REFRESH_THROTTLE).await;
        ctx.synchronize(false, &cancel).await.unwrap();
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refresh_keeps_known_fields() {
        let (_env, transport, ctx) = setup();
        let cancel = CancellationToken::new();
        transport.push(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "A", "desc": "Known"})),
        );
        transport.push(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "B"})),
        );

        ctx.synchronize(true, &cancel).await.unwrap();
        let document = ctx.synchronize(true, &cancel).await.unwrap();

        assert_eq!(document.get("name"), Some(&json!("B")));
        assert_eq!(document.get("desc"), Some(&json!("Known")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_publishes_changed_property_names() {
        let (env, transport, ctx) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = env
            .events()
            .subscribe(EventFilter::for_kind(EntityKind::Card), move |event: &EntityEvent| {
                sink.lock().unwrap().push(event.changed_fields().to_vec());
                Ok(())
            })
            .unwrap();
        transport.always(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "A", "desc": "D"})),
        );
        let cancel = CancellationToken::new();

        ctx.synchronize(true, &cancel).await.unwrap();
        ctx.synchronize(true, &cancel).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "an unchanged refresh publishes nothing");
        let mut changed = seen[0].clone();
        changed.sort();
        assert_eq!(changed, vec!["Description", "Name"]);
    }

    #[test]
    fn test_merge_precedence_without_runtime() {
        let (_env, _transport, ctx) = setup();
        ctx.write("name", json!("Local")).unwrap();
        assert_eq!(ctx.state(), LifecycleState::Dirty);

        let changed = ctx.merge(&doc(json!({"name": "Server", "desc": "D"})), false);
        assert_eq!(changed, vec!["Description"]);
        assert_eq!(ctx.value("name"), Some(json!("Local")));
        assert_eq!(ctx.pending_fields(), vec!["name"]);

        let changed = ctx.merge(&doc(json!({"name": "Server"})), true);
        assert_eq!(changed, vec!["Name"]);
        assert_eq!(ctx.value("name"), Some(json!("Server")));
        assert!(!ctx.is_dirty());
    }

    #[test]
    fn test_writing_current_value_is_noop() {
        let (_env, _transport, ctx) = setup();
        ctx.merge(&doc(json!({"name": "Same"})), false);

        ctx.write("name", json!("Same")).unwrap();
        ctx.write("desc", Value::Null).unwrap();

        assert!(!ctx.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_writes() {
        let (_env, transport, ctx) = setup();

        ctx.write("name", json!("a")).unwrap();
        sleep(Duration::from_millis(60)).await;
        ctx.write("name", json!("b")).unwrap();
        sleep(Duration::from_millis(60)).await;
        ctx.write("name", json!("c")).unwrap();
        ctx.write("desc", json!("d")).unwrap();
        assert_eq!(transport.calls(RequestKind::CardWriteUpdate), 0);

        sleep(Duration::from_millis(200)).await;

        let requests = transport.requests(RequestKind::CardWriteUpdate);
        assert_eq!(requests.len(), 1);
        let payload = requests[0].payload.as_ref().unwrap();
        assert_eq!(payload.get("name"), Some(&json!("c")));
        assert_eq!(payload.get("desc"), Some(&json!("d")));
        assert!(requests[0].body.is_some());
        assert!(!ctx.is_dirty());
        assert_eq!(ctx.state(), LifecycleState::Stub);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_during_submit_stay_pending() {
        let (_env, transport, ctx) = setup();
        transport.set_delay(Duration::from_millis(100));
        transport.push(
            RequestKind::CardWriteUpdate,
            Response::ok(json!({"id": "c1", "name": "a"})),
        );

        ctx.write("name", json!("a")).unwrap();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(ctx.state(), LifecycleState::Submitting);

        ctx.write("name", json!("b")).unwrap();
        ctx.write("desc", json!("d")).unwrap();
        sleep(Duration::from_millis(70)).await;

        assert_eq!(transport.calls(RequestKind::CardWriteUpdate), 1);
        assert_eq!(ctx.pending_fields(), vec!["desc", "name"]);
        assert_eq!(ctx.value("name"), Some(json!("b")));

        sleep(Duration::from_millis(300)).await;

        let requests = transport.requests(RequestKind::CardWriteUpdate);
        assert_eq!(requests.len(), 2);
        let second = requests[1].payload.as_ref().unwrap();
        assert_eq!(second.get("name"), Some(&json!("b")));
        assert_eq!(second.get("desc"), Some(&json!("d")));
        assert!(!ctx.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submit_retains_dirty_fields() {
        let (_env, transport, ctx) = setup();
        transport.push(RequestKind::CardWriteUpdate, Response::error(500, "boom"));
        let cancel = CancellationToken::new();

        ctx.write("name", json!("x")).unwrap();
        let err = ctx.flush(&cancel).await.unwrap_err();

        assert_eq!(
            err,
            TetherError::Transport(TransportError::Status {
                request: RequestKind::CardWriteUpdate,
                status: 500,
                attempts: 1,
                message: "boom".to_string(),
            })
        );
        assert_eq!(ctx.state(), LifecycleState::Dirty);
        assert_eq!(ctx.value("name"), Some(json!("x")));

        ctx.flush(&cancel).await.unwrap();
        assert!(!ctx.is_dirty());
        assert_eq!(transport.calls(RequestKind::CardWriteUpdate), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_with_nothing_pending_is_noop() {
        let (_env, transport, ctx) = setup();
        ctx.flush(&CancellationToken::new()).await.unwrap();
        assert_eq!(transport.calls(RequestKind::CardWriteUpdate), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_one_caller_detaches_only_that_caller() {
        let (_env, transport, ctx) = setup();
        transport.set_delay(Duration::from_millis(100));
        transport.push(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "Fetched"})),
        );
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();

        let (ca, ta) = (ctx.clone(), token_a.clone());
        let a = tokio::spawn(async move { ca.synchronize(false, &ta).await });
        let (cb, tb) = (ctx.clone(), token_b.clone());
        let b = tokio::spawn(async move { cb.synchronize(false, &tb).await });

        sleep(Duration::from_millis(10)).await;
        token_a.cancel();

        assert!(a.await.unwrap().unwrap_err().is_cancelled());
        let document = b.await.unwrap().unwrap();
        assert_eq!(document.get("name"), Some(&json!("Fetched")));
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 1);
        assert_eq!(ctx.state(), LifecycleState::Synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_terminal_and_idempotent() {
        let (env, transport, ctx) = setup();
        let cached = env
            .resolve(EntityKind::Card, EntityId::from("c1"), || ctx.clone())
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = env
            .events()
            .subscribe(EventFilter::any(), move |event: &EntityEvent| {
                sink.lock().unwrap().push(event.event_type());
                Ok(())
            })
            .unwrap();
        let cancel = CancellationToken::new();
        let deletable = DeletableContext::new((*cached).clone()).unwrap();

        let (first, second) = tokio::join!(deletable.delete(&cancel), deletable.delete(&cancel));
        first.unwrap();
        second.unwrap();
        deletable.delete(&cancel).await.unwrap();

        assert_eq!(transport.calls(RequestKind::CardWriteDelete), 1);
        assert_eq!(ctx.state(), LifecycleState::Deleted);
        assert_eq!(*events.lock().unwrap(), vec![EventType::Deleted]);
        assert!(env.cache().is_empty());

        assert!(matches!(
            ctx.synchronize(true, &cancel).await,
            Err(TetherError::Sync(SyncError::Deleted { .. }))
        ));
        assert!(ctx.write("name", json!("late")).is_err());
        assert!(ctx.flush(&cancel).await.is_err());
        assert!(ctx.merge(&doc(json!({"name": "late"})), true).is_empty());
    }

    #[test]
    fn test_kind_without_delete_request_is_not_deletable() {
        let (env, _transport, _ctx) = setup();
        let list = SyncContext::new(&env, &LIST, "l1");
        assert!(matches!(
            DeletableContext::new(list),
            Err(TetherError::Sync(SyncError::NotDeletable {
                kind: EntityKind::List
            }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_service_errors_leave_state_unchanged() {
        let (_env, transport, ctx) =
            setup_with(SyncConfig::default().with_throw_on_service_error(false));
        transport.push(RequestKind::CardReadRefresh, Response::error(500, "down"));
        transport.push(RequestKind::CardWriteUpdate, Response::error(500, "down"));
        transport.push(RequestKind::CardWriteDelete, Response::error(500, "down"));
        let cancel = CancellationToken::new();

        let document = ctx.synchronize(true, &cancel).await.unwrap();
        assert_eq!(document.len(), 1);
        assert_eq!(ctx.state(), LifecycleState::Stub);

        ctx.write("name", json!("x")).unwrap();
        ctx.flush(&cancel).await.unwrap();
        assert!(ctx.is_dirty());

        DeletableContext::new(ctx.clone())
            .unwrap()
            .delete(&cancel)
            .await
            .unwrap();
        assert!(!ctx.is_deleted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_refresh_payload_is_reported() {
        let (_env, transport, ctx) = setup();
        transport.push(RequestKind::CardReadRefresh, Response::ok(json!([1, 2, 3])));

        let err = ctx
            .synchronize(true, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TetherError::Transport(TransportError::MalformedResponse { .. })
        ));
        assert_eq!(ctx.state(), LifecycleState::Stub);
    }

    #[test]
    fn test_apply_marks_synchronized() {
        let (_env, _transport, ctx) = setup();
        let changed = ctx.apply_raw(br#"{"id": "c1", "name": "Batched"}"#).unwrap();
        assert_eq!(changed, vec!["Name"]);
        assert_eq!(ctx.state(), LifecycleState::Synchronized);
    }

    struct CountingDependency {
        seen: Mutex<Vec<Value>>,
    }

    impl DependencyMerge for CountingDependency {
        fn wire_key(&self) -> &'static str {
            "pos"
        }

        fn merge(&self, value: &Value, _overwrite: bool) -> bool {
            self.seen.lock().unwrap().push(value.clone());
            true
        }
    }

    #[test]
    fn test_dependency_fields_bypass_the_document() {
        let (_env, _transport, ctx) = setup();
        let dependency = Arc::new(CountingDependency {
            seen: Mutex::new(Vec::new()),
        });
        ctx.register_dependency(dependency.clone());

        let changed = ctx.merge(&doc(json!({"pos": [1, 2]})), false);

        assert_eq!(changed, vec!["Position"]);
        assert!(ctx.value("pos").is_none());
        assert_eq!(*dependency.seen.lock().unwrap(), vec![json!([1, 2])]);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        const KEYS: &[&str] = &["name", "desc", "pos"];

        fn arb_document() -> impl Strategy<Value = Document> {
            prop::collection::btree_map(
                prop::sample::select(KEYS.to_vec()),
                prop_oneof![
                    any::<bool>().prop_map(Value::Bool),
                    any::<i16>().prop_map(|n| json!(n)),
                    "[a-z]{0,6}".prop_map(Value::String),
                ],
                0..=KEYS.len(),
            )
            .prop_map(|fields| {
                fields
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn prop_pending_fields_win_unless_overwrite(
                local in arb_document(),
                incoming in arb_document(),
                overwrite in any::<bool>(),
            ) {
                let (_env, _transport, ctx) = setup();
                for (key, value) in local.iter() {
                    ctx.write(key, value.clone()).unwrap();
                }
                let pending = ctx.pending_fields();

                ctx.merge(&incoming, overwrite);
                let document = ctx.document();

                for (key, value) in incoming.iter() {
                    if overwrite || !pending.iter().any(|p| p == key) {
                        prop_assert_eq!(document.get(key), Some(value));
                    }
                }
                for key in &pending {
                    if !overwrite || !incoming.contains(key) {
                        prop_assert_eq!(document.get(key), local.get(key));
                        prop_assert!(ctx.pending_fields().contains(key));
                    }
                }
            }
        }
    }
}
