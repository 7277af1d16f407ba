//! Tether Test Utilities
//!
//! Shared test infrastructure for the tether workspace:
//! - An in-memory mock of the remote service
//! - Proptest generators for ids, documents and configuration
//! - Fixtures for environments with fast timings
//! - Assertions on the error taxonomy
//! - Tracing initialization for test output

pub use tether_core::{
    Document, EntityId, EntityKey, EntityKind, Position, Request, RequestKind, Response,
    SyncConfig, SyncError, TetherError, TetherResult, TransportError, ValidationError,
};
pub use tether_sync::{CancellationToken, SyncEnv};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_core::Transport;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Response),
    Unreachable(String),
}

/// In-memory stand-in for the remote service.
///
/// Keeps one document per entity. `*ReadRefresh` returns the stored
/// document, `*WriteUpdate` merges the payload into it and returns the
/// result, `*WriteDelete` removes it. Scripted responses take precedence and
/// are consumed in order. Every request is logged.
#[derive(Default)]
pub struct MockTransport {
    remote: Mutex<HashMap<EntityKey, Document>>,
    scripted: Mutex<HashMap<RequestKind, VecDeque<Scripted>>>,
    log: Mutex<Vec<Request>>,
    batches: Mutex<Vec<usize>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a remote document. `value` must be a JSON object.
    pub fn seed(&self, kind: EntityKind, id: &str, value: Value) {
        let mut document = Document::from_value(value).unwrap_or_default();
        document.insert("id", Value::String(id.to_string()));
        lock(&self.remote).insert(EntityKey::new(kind, id), document);
    }

    /// Current remote document, if any.
    pub fn remote(&self, kind: EntityKind, id: &str) -> Option<Document> {
        lock(&self.remote).get(&EntityKey::new(kind, id)).cloned()
    }

    /// Queue a one-shot response for `kind`.
    pub fn respond(&self, kind: RequestKind, response: Response) {
        self.script(kind, Scripted::Respond(response));
    }

    /// Fail the next `times` calls of `kind` with `status`.
    pub fn fail(&self, kind: RequestKind, status: u16, times: usize) {
        for _ in 0..times {
            self.script(kind, Scripted::Respond(Response::error(status, "injected failure")));
        }
    }

    /// Make the next call of `kind` produce no response at all.
    pub fn unreachable(&self, kind: RequestKind, reason: impl Into<String>) {
        self.script(kind, Scripted::Unreachable(reason.into()));
    }

    fn script(&self, kind: RequestKind, entry: Scripted) {
        lock(&self.scripted).entry(kind).or_default().push_back(entry);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn calls(&self, kind: RequestKind) -> usize {
        lock(&self.log).iter().filter(|r| r.kind() == kind).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn requests(&self, kind: RequestKind) -> Vec<Request> {
        lock(&self.log)
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    /// Payload of the most recent call of `kind`.
    pub fn last_payload(&self, kind: RequestKind) -> Option<Document> {
        lock(&self.log)
            .iter()
            .rev()
            .find(|r| r.kind() == kind)
            .and_then(|r| r.payload.clone())
    }

    /// Sizes of the batched calls received, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.batches).clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
        lock(&self.batches).clear();
    }

    fn serve(&self, request: &Request) -> TetherResult<Response> {
        let kind = request.kind();
        if let Some(entry) = lock(&self.scripted).get_mut(&kind).and_then(VecDeque::pop_front) {
            return match entry {
                Scripted::Respond(response) => Ok(response),
                Scripted::Unreachable(reason) => {
                    Err(TransportError::Unreachable { request: kind, reason }.into())
                }
            };
        }

        let (Some(target), Some(id)) = (kind.target(), request.param("_id")) else {
            return Ok(Response::error(404, format!("no route for {kind}")));
        };
        let key = EntityKey::new(target, id);
        let name = kind.name();
        let mut remote = lock(&self.remote);

        if name.ends_with("ReadRefresh") {
            Ok(match remote.get(&key) {
                Some(document) => Response::ok(document.clone().into_value()),
                None => Response::error(404, format!("{key} not found")),
            })
        } else if name.ends_with("WriteUpdate") {
            let document = remote.entry(key).or_insert_with(|| {
                let mut document = Document::new();
                document.insert("id", json!(id));
                document
            });
            if let Some(payload) = &request.payload {
                document.merge_from(payload, |_| false);
            }
            Ok(Response::ok(document.clone().into_value()))
        } else if name.ends_with("WriteDelete") {
            Ok(match remote.remove(&key) {
                Some(_) => Response::empty(),
                None => Response::error(404, format!("{key} not found")),
            })
        } else {
            Ok(Response::error(404, format!("no route for {kind}")))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &Request) -> TetherResult<Response> {
        lock(&self.log).push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self.serve(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute_batch(&self, requests: &[Request]) -> TetherResult<Vec<Response>> {
        lock(&self.batches).push(requests.len());
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.execute(request).await?);
        }
        Ok(responses)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-writer subscriber filtered by `TETHER_LOG`, then
/// `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("TETHER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tether types.

    use super::*;
    use proptest::prelude::*;

    /// A well-formed remote id: 24 lowercase hex characters.
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        "[0-9a-f]{24}".prop_map(EntityId::new)
    }

    pub fn arb_entity_kind() -> impl Strategy<Value = EntityKind> {
        prop::sample::select(EntityKind::ALL.to_vec())
    }

    /// Scalar JSON values as they appear in entity documents.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        ]
    }

    /// Documents over a fixed key space so merges overlap.
    pub fn arb_document(keys: &'static [&'static str]) -> impl Strategy<Value = Document> {
        prop::collection::btree_map(prop::sample::select(keys.to_vec()), arb_scalar(), 0..=keys.len())
            .prop_map(|fields| {
                fields
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect()
            })
    }

    pub fn arb_position() -> impl Strategy<Value = Position> {
        prop_oneof![
            Just(Position::Top),
            Just(Position::Bottom),
            (0.001f64..1.0e9).prop_map(Position::Fixed),
        ]
    }

    /// Configurations that pass validation.
    pub fn arb_valid_config() -> impl Strategy<Value = SyncConfig> {
        (
            1u64..1_000,
            0u64..60_000,
            prop::collection::btree_set(400u16..600, 0..4),
            0u32..5,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(submit_ms, throttle_ms, codes, retries, consistency, throw)| {
                    SyncConfig::default()
                        .with_change_submission_time(Duration::from_millis(submit_ms))
                        .with_refresh_throttle(Duration::from_millis(throttle_ms))
                        .with_retry_status_codes(codes)
                        .with_max_retry_count(retries)
                        .with_consistency_processing(consistency)
                        .with_throw_on_service_error(throw)
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built environments and ids.

    use super::*;

    pub const CHANGE_SUBMISSION_TIME: Duration = Duration::from_millis(100);
    pub const REFRESH_THROTTLE: Duration = Duration::from_secs(5);

    /// Defaults with retries on 429/503 and consistency processing enabled.
    pub fn test_config() -> SyncConfig {
        SyncConfig::default()
            .with_change_submission_time(CHANGE_SUBMISSION_TIME)
            .with_refresh_throttle(REFRESH_THROTTLE)
            .with_retry_status_codes([429, 503])
            .with_max_retry_count(2)
            .with_delay_between_retries(Duration::from_millis(10))
            .with_consistency_processing(true)
    }

    /// An environment over a fresh mock transport.
    pub fn mock_env() -> (SyncEnv, Arc<MockTransport>) {
        mock_env_with(test_config())
    }

    pub fn mock_env_with(config: SyncConfig) -> (SyncEnv, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let env = SyncEnv::builder(transport.clone())
            .with_config(config)
            .build()
            .expect("test config is valid");
        (env, transport)
    }

    /// Deterministic well-formed id for index `n`.
    pub fn hex_id(n: u64) -> String {
        format!("{n:024x}")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the tether error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &TetherResult<T>, rules: &[&str]) {
        match result {
            Err(TetherError::Validation(ValidationError::RuleChainFailed { violations, .. })) => {
                let names: Vec<&str> = violations.iter().map(|v| v.rule.as_str()).collect();
                assert_eq!(names, rules, "Unexpected rule violations");
            }
            other => panic!("Expected rule chain failure, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_status<T: std::fmt::Debug>(result: &TetherResult<T>, expected: u16) {
        match result {
            Err(TetherError::Transport(e)) if e.status() == Some(expected) => {}
            other => panic!("Expected status {}, got: {:?}", expected, other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &TetherResult<T>) {
        match result {
            Err(e) if e.is_cancelled() => {}
            other => panic!("Expected cancellation, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_deleted<T: std::fmt::Debug>(result: &TetherResult<T>) {
        match result {
            Err(TetherError::Sync(SyncError::Deleted { .. })) => {}
            other => panic!("Expected Deleted error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
