//! Staleness contracts for entity reads.
//!
//! Callers state how much staleness they tolerate through [`ReadMode`]; each
//! context tracks when it last refreshed through a [`StalenessClock`].

use std::time::Duration;
use tokio::time::Instant;

/// How a read treats the local copy of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Refresh only if the entity was never fetched or the throttle window
    /// has elapsed since the last refresh.
    #[default]
    Throttled,
    /// Never touch the network. Returns whatever is known locally.
    CacheOnly,
    /// Refresh regardless of the throttle. Still subject to retries.
    Force,
}

impl ReadMode {
    pub fn from_force(force: bool) -> Self {
        if force {
            Self::Force
        } else {
            Self::Throttled
        }
    }

    /// Whether a read in this mode must go to the network.
    pub fn requires_refresh(&self, clock: &StalenessClock, now: Instant) -> bool {
        match self {
            Self::Force => true,
            Self::CacheOnly => false,
            Self::Throttled => clock.is_expired(now),
        }
    }
}

/// Last successful refresh plus the minimum refresh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessClock {
    last_refresh: Option<Instant>,
    throttle: Duration,
}

impl StalenessClock {
    pub fn new(throttle: Duration) -> Self {
        Self {
            last_refresh: None,
            throttle,
        }
    }

    /// True when the entity was never refreshed or the throttle window
    /// has elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.throttle,
        }
    }

    /// Record a successful refresh.
    pub fn touch(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// Age of the local copy, `None` if never refreshed.
    pub fn staleness(&self, now: Instant) -> Option<Duration> {
        self.last_refresh
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }
}
