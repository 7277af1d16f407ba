//! Request batching for first-time refreshes.
//!
//! Read requests queued within one window (or until the batch is full) are
//! sent as a single [`Transport::execute_batch`] call. The response slices
//! are routed back to their callers by position. A failed slice is retried
//! on its own under the retry policy before its caller sees it.

use crate::retry::RetryPolicy;
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_core::{Request, Response, SyncError, TetherError, TetherResult, Transport};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Waiter = oneshot::Sender<TetherResult<Response>>;

#[derive(Default)]
struct Queue {
    entries: Vec<(Request, Waiter)>,
    /// A window timer is running for the current entries.
    scheduled: bool,
}

struct BatchInner {
    transport: Arc<dyn Transport>,
    window: Duration,
    max_size: usize,
    retry: RetryPolicy,
    queue: Mutex<Queue>,
}

/// Coalesces read requests into batched transport calls.
///
/// A non-success slice fails only its own caller, once the retry policy
/// gives up on it.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<BatchInner>,
}

impl BatchCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        window: Duration,
        max_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                transport,
                window,
                max_size: max_size.max(1),
                retry,
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Number of requests waiting for the next dispatch.
    pub fn queued(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Queue `request` and wait for its slice of the batched response.
    pub async fn fetch(&self, request: Request) -> TetherResult<Response> {
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();

        let full = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.entries.push((request, tx));
            if queue.entries.len() >= self.inner.max_size {
                Some(std::mem::take(&mut queue.entries))
            } else {
                if !queue.scheduled {
                    queue.scheduled = true;
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(inner.window).await;
                        let entries = {
                            let mut queue =
                                inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
                            queue.scheduled = false;
                            std::mem::take(&mut queue.entries)
                        };
                        inner.dispatch(entries).await;
                    });
                }
                None
            }
        };

        if let Some(entries) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.dispatch(entries).await });
        }

        rx.await
            .unwrap_or_else(|_| Err(SyncError::BatchAbandoned { request: kind }.into()))
    }
}

impl BatchInner {
    async fn dispatch(&self, entries: Vec<(Request, Waiter)>) {
        if entries.is_empty() {
            return;
        }

        let (requests, waiters): (Vec<Request>, Vec<Waiter>) = entries.into_iter().unzip();
        debug!(size = requests.len(), "Dispatching batched requests");

        match self.transport.execute_batch(&requests).await {
            Ok(responses) => {
                if responses.len() != requests.len() {
                    warn!(
                        expected = requests.len(),
                        received = responses.len(),
                        "Batch response size mismatch"
                    );
                }
                let mut responses = responses.into_iter();
                let slices = requests.iter().zip(waiters).enumerate().map(
                    |(index, (request, waiter))| {
                        let response = responses.next();
                        async move {
                            let outcome = match response {
                                Some(response) => {
                                    self.retry
                                        .settle(self.transport.as_ref(), request, response)
                                        .await
                                }
                                None => Err(SyncError::BatchSliceMissing {
                                    request: request.kind(),
                                    index,
                                }
                                .into()),
                            };
                            // The caller may have detached.
                            let _ = waiter.send(outcome);
                        }
                    },
                );
                join_all(slices).await;
            }
            Err(error) => {
                warn!(size = requests.len(), error = %error, "Batched request failed");
                for waiter in waiters {
                    let _ = waiter.send(Err::<Response, TetherError>(error.clone()));
                }
            }
        }
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("window", &self.inner.window)
            .field("max_size", &self.inner.max_size)
            .field("queued", &self.queued())
            .finish()
    }
}
