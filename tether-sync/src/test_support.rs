//! Scripted transport for unit tests inside this crate.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tether_core::{Request, RequestKind, Response, TetherResult, Transport};

#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<RequestKind, VecDeque<Response>>>,
    fallback: Mutex<HashMap<RequestKind, Response>>,
    requests: Mutex<Vec<Request>>,
    delay: Mutex<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for `kind`.
    pub fn push(&self, kind: RequestKind, response: Response) {
        self.queued
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(response);
    }

    /// Response used once the queue for `kind` is empty.
    pub fn always(&self, kind: RequestKind, response: Response) {
        self.fallback.lock().unwrap().insert(kind, response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, kind: RequestKind) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    pub fn requests(&self, kind: RequestKind) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &Request) -> TetherResult<Response> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let kind = request.kind();
        if let Some(response) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }
        if let Some(response) = self.fallback.lock().unwrap().get(&kind) {
            return Ok(response.clone());
        }
        Ok(Response::ok(json!({ "id": request.param("_id") })))
    }
}
