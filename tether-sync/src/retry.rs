//! Retry policy wrapped around every outbound call.
//!
//! A response that is not successful is offered to a predicate together with
//! the 1-based attempt number. When the predicate allows it the call is
//! re-issued after a fixed delay. The attempt count is capped at
//! `max_retry_count + 1` whatever the predicate says.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Request, Response, SyncConfig, TetherResult, Transport, TransportError};
use tracing::debug;

/// Decides whether a failed response should be retried.
///
/// Receives the failed response and the number of attempts made so far.
pub type RetryPredicate = Arc<dyn Fn(&Response, u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    retry_status_codes: BTreeSet<u16>,
    max_retry_count: u32,
    delay_between_retries: Duration,
    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(
        retry_status_codes: BTreeSet<u16>,
        max_retry_count: u32,
        delay_between_retries: Duration,
    ) -> Self {
        Self {
            retry_status_codes,
            max_retry_count,
            delay_between_retries,
            predicate: None,
        }
    }

    /// Never retries.
    pub fn none() -> Self {
        Self::new(BTreeSet::new(), 0, Duration::ZERO)
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.retry_status_codes.clone(),
            config.max_retry_count,
            config.delay_between_retries,
        )
    }

    /// Replace the default status-code predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retry_count.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed
    /// with `response`.
    pub fn should_retry(&self, response: &Response, attempt: u32) -> bool {
        if attempt > self.max_retry_count {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(response, attempt),
            None => self.retry_status_codes.contains(&response.status),
        }
    }

    /// Execute `request` until it succeeds or the policy gives up.
    ///
    /// Transport-level `Err`s carry no response and are returned at once.
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        request: &Request,
    ) -> TetherResult<Response> {
        let response = transport.execute(request).await?;
        self.settle(transport, request, response).await
    }

    /// Continue from a first `response` already obtained for `request`,
    /// re-issuing it through `transport` while the policy allows.
    pub async fn settle(
        &self,
        transport: &dyn Transport,
        request: &Request,
        mut response: Response,
    ) -> TetherResult<Response> {
        let mut attempt = 1u32;
        loop {
            if response.is_success() {
                return Ok(response);
            }

            if !self.should_retry(&response, attempt) {
                return Err(TransportError::Status {
                    request: request.kind(),
                    status: response.status,
                    attempts: attempt,
                    message: response.message.unwrap_or_default(),
                }
                .into());
            }

            debug!(
                request = %request.kind(),
                status = response.status,
                attempt = attempt,
                delay_ms = self.delay_between_retries.as_millis() as u64,
                "Retrying request"
            );
            if !self.delay_between_retries.is_zero() {
                tokio::time::sleep(self.delay_between_retries).await;
            }
            response = transport.execute(request).await?;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_status_codes", &self.retry_status_codes)
            .field("max_retry_count", &self.max_retry_count)
            .field("delay_between_retries", &self.delay_between_retries)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}
