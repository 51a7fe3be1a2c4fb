//! Configuration for stores, queues and caches.

use crate::change::UpdateDeletePolicy;
use std::env;
use std::time::Duration;

/// Exponential backoff applied to automatic retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any retry delay
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retrying a record that has failed `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let secs = if secs.is_nan() { max } else { secs.clamp(0.0, max) };
        Duration::from_secs_f64(secs)
    }
}

/// Change queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Quiet period after the last enqueue before a batch is sent
    pub debounce: Duration,
    /// Attempts per record before a failure is parked for manual retry
    pub max_retries: u32,
    /// Maximum number of records per batch (`None` = unlimited)
    pub max_batch_size: Option<usize>,
    /// How a delete following a pending update is coalesced
    pub update_delete_policy: UpdateDeletePolicy,
    /// Delay schedule for automatic retries
    pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_retries: 3,
            max_batch_size: None,
            update_delete_policy: UpdateDeletePolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Read cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of cached results (0 disables caching)
    pub capacity: usize,
    /// Age after which an entry is treated as absent
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            max_age: Duration::from_secs(300),
        }
    }
}

/// Everything a [`Store`](crate::Store) needs besides its transports.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Collection identifier, part of every read cache key
    pub collection: String,
    /// Change queue settings
    pub queue: QueueConfig,
    /// Read cache settings
    pub cache: CacheConfig,
}

impl StoreConfig {
    /// Default configuration for a collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Load configuration from `TETHER_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env(collection: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(collection, |key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(
        collection: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(collection);

        if let Some(ms) = parse_number::<u64>(&lookup, "TETHER_DEBOUNCE_MS")? {
            config.queue.debounce = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_number::<u32>(&lookup, "TETHER_MAX_RETRIES")? {
            config.queue.max_retries = retries;
        }
        if let Some(size) = parse_number::<usize>(&lookup, "TETHER_MAX_BATCH_SIZE")? {
            config.queue.max_batch_size = (size > 0).then_some(size);
        }
        if let Some(capacity) = parse_number::<usize>(&lookup, "TETHER_CACHE_CAPACITY")? {
            config.cache.capacity = capacity;
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "TETHER_CACHE_MAX_AGE_MS")? {
            config.cache.max_age = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("TETHER_UPDATE_DELETE_POLICY") {
            config.queue.update_delete_policy = match policy.trim() {
                "keep-both" => UpdateDeletePolicy::KeepBoth,
                "collapse-to-delete" => UpdateDeletePolicy::CollapseToDelete,
                _ => return Err(ConfigError::InvalidPolicy(policy)),
            };
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid TETHER_UPDATE_DELETE_POLICY: {0} (expected keep-both or collapse-to-delete)")]
    InvalidPolicy(String),
}
