//! Configuration types
//!
//! [`SyncConfig`] is an explicit value built once at startup and handed to the
//! synchronization environment. Behavioral hooks that are not plain data
//! (cache implementation, retry predicate override, serializer) are supplied
//! alongside it when the environment is built.

use crate::{ConfigError, TetherResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHANGE_SUBMISSION_TIME: Duration = Duration::from_millis(100);
pub const DEFAULT_REFRESH_THROTTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(25);
pub const DEFAULT_BATCH_MAX_SIZE: usize = 10;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Run-time options for the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Evict deleted entities from the identity cache.
    pub remove_deleted_items_from_cache: bool,
    /// Quiet period after the last write before pending changes are submitted.
    #[serde(with = "duration_millis")]
    pub change_submission_time: Duration,
    /// Minimum interval between voluntary refreshes of one entity.
    #[serde(with = "duration_millis")]
    pub refresh_throttle: Duration,
    /// Response statuses that trigger an automatic retry.
    pub retry_status_codes: BTreeSet<u16>,
    /// Retries allowed after the first attempt.
    pub max_retry_count: u32,
    /// Fixed delay between attempts.
    #[serde(with = "duration_millis")]
    pub delay_between_retries: Duration,
    /// Keep collections consistent through the event channel.
    pub enable_consistency_processing: bool,
    /// Surface terminal remote failures to callers instead of swallowing them.
    pub throw_on_service_error: bool,
    /// How long the batch coordinator waits to collect stub refreshes.
    #[serde(with = "duration_millis")]
    pub batch_window: Duration,
    /// Maximum number of requests coalesced into one batch call.
    pub batch_max_size: usize,
    /// Capacity of the broadcast side of the event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remove_deleted_items_from_cache: true,
            change_submission_time: DEFAULT_CHANGE_SUBMISSION_TIME,
            refresh_throttle: DEFAULT_REFRESH_THROTTLE,
            retry_status_codes: BTreeSet::new(),
            max_retry_count: 0,
            delay_between_retries: Duration::ZERO,
            enable_consistency_processing: false,
            throw_on_service_error: true,
            batch_window: DEFAULT_BATCH_WINDOW,
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_change_submission_time(mut self, duration: Duration) -> Self {
        self.change_submission_time = duration;
        self
    }

    pub fn with_refresh_throttle(mut self, duration: Duration) -> Self {
        self.refresh_throttle = duration;
        self
    }

    pub fn with_retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_delay_between_retries(mut self, delay: Duration) -> Self {
        self.delay_between_retries = delay;
        self
    }

    pub fn with_remove_deleted_items_from_cache(mut self, enabled: bool) -> Self {
        self.remove_deleted_items_from_cache = enabled;
        self
    }

    pub fn with_consistency_processing(mut self, enabled: bool) -> Self {
        self.enable_consistency_processing = enabled;
        self
    }

    pub fn with_throw_on_service_error(mut self, enabled: bool) -> Self {
        self.throw_on_service_error = enabled;
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    pub fn with_batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = size;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - retry status codes are HTTP-like (100..=599)
    /// - batch_max_size > 0
    /// - event_buffer > 0
    pub fn validate(&self) -> TetherResult<()> {
        if let Some(code) = self
            .retry_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(ConfigError::InvalidValue {
                field: "retry_status_codes".to_string(),
                value: code.to_string(),
                reason: "status codes must be between 100 and 599".to_string(),
            }
            .into());
        }

        if self.batch_max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_max_size".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Create a SyncConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TETHER_CHANGE_SUBMISSION_MS`: debounce before submitting (default: 100)
    /// - `TETHER_REFRESH_THROTTLE_MS`: minimum refresh interval (default: 5000)
    /// - `TETHER_RETRY_STATUS_CODES`: comma separated statuses (default: none)
    /// - `TETHER_MAX_RETRY_COUNT`: retries after the first attempt (default: 0)
    /// - `TETHER_RETRY_DELAY_MS`: delay between attempts (default: 0)
    /// - `TETHER_REMOVE_DELETED_FROM_CACHE`: evict deleted entities (default: true)
    /// - `TETHER_CONSISTENCY_PROCESSING`: cross-collection updates (default: false)
    /// - `TETHER_THROW_ON_SERVICE_ERROR`: surface remote failures (default: true)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key);

        let millis = |key: &str, default: Duration| {
            parse_or(parse(key), default.as_millis() as u64)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let retry_status_codes = parse("TETHER_RETRY_STATUS_CODES")
            .and_then(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().parse::<u16>())
                    .collect::<Result<BTreeSet<_>, _>>()
                    .ok()
            })
            .unwrap_or(defaults.retry_status_codes.clone());

        Self {
            remove_deleted_items_from_cache: parse_or(
                parse("TETHER_REMOVE_DELETED_FROM_CACHE"),
                defaults.remove_deleted_items_from_cache,
            )
            .unwrap_or(defaults.remove_deleted_items_from_cache),
            change_submission_time: millis(
                "TETHER_CHANGE_SUBMISSION_MS",
                defaults.change_submission_time,
            ),
            refresh_throttle: millis("TETHER_REFRESH_THROTTLE_MS", defaults.refresh_throttle),
            retry_status_codes,
            max_retry_count: parse_or(parse("TETHER_MAX_RETRY_COUNT"), defaults.max_retry_count)
                .unwrap_or(defaults.max_retry_count),
            delay_between_retries: millis("TETHER_RETRY_DELAY_MS", defaults.delay_between_retries),
            enable_consistency_processing: parse_or(
                parse("TETHER_CONSISTENCY_PROCESSING"),
                defaults.enable_consistency_processing,
            )
            .unwrap_or(defaults.enable_consistency_processing),
            throw_on_service_error: parse_or(
                parse("TETHER_THROW_ON_SERVICE_ERROR"),
                defaults.throw_on_service_error,
            )
            .unwrap_or(defaults.throw_on_service_error),
            ..defaults
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> Option<T> {
    match raw {
        Some(raw) => raw.trim().parse().ok(),
        None => Some(default),
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.change_submission_time, Duration::from_millis(100));
        assert_eq!(config.refresh_throttle, Duration::from_secs(5));
        assert!(config.remove_deleted_items_from_cache);
        assert!(config.throw_on_service_error);
        assert!(!config.enable_consistency_processing);
        assert_eq!(config.max_retry_count, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new()
            .with_change_submission_time(Duration::from_millis(10))
            .with_refresh_throttle(Duration::from_secs(1))
            .with_retry_status_codes([429, 503])
            .with_max_retry_count(2)
            .with_delay_between_retries(Duration::from_millis(50))
            .with_consistency_processing(true)
            .with_throw_on_service_error(false);

        assert_eq!(config.change_submission_time, Duration::from_millis(10));
        assert!(config.retry_status_codes.contains(&429));
        assert_eq!(config.max_retry_count, 2);
        assert!(config.enable_consistency_processing);
        assert!(!config.throw_on_service_error);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyncConfig::new().with_retry_status_codes([42]).validate().is_err());
        assert!(SyncConfig::new().with_batch_max_size(0).validate().is_err());
        assert!(SyncConfig::new().with_event_buffer(0).validate().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TETHER_CHANGE_SUBMISSION_MS", "250"),
            ("TETHER_RETRY_STATUS_CODES", "429, 503"),
            ("TETHER_MAX_RETRY_COUNT", "3"),
            ("TETHER_THROW_ON_SERVICE_ERROR", "false"),
            ("TETHER_REFRESH_THROTTLE_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.change_submission_time, Duration::from_millis(250));
        assert_eq!(
            config.retry_status_codes.iter().copied().collect::<Vec<_>>(),
            vec![429, 503]
        );
        assert_eq!(config.max_retry_count, 3);
        assert!(!config.throw_on_service_error);
        assert_eq!(config.refresh_throttle, DEFAULT_REFRESH_THROTTLE);
    }

    #[test]
    fn test_serde_uses_millis() {
        let config = SyncConfig::new().with_change_submission_time(Duration::from_millis(40));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["change_submission_time"], 40);

        let back: SyncConfig = serde_json::from_value(serde_json::json!({
            "refresh_throttle": 750
        }))
        .unwrap();
        assert_eq!(back.refresh_throttle, Duration::from_millis(750));
        assert_eq!(back.change_submission_time, DEFAULT_CHANGE_SUBMISSION_TIME);
    }
}
