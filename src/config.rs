//! Cache configuration.
//!
//! [`CacheConfig`] is the runtime policy object handed to
//! [`CacheService::builder()`](crate::CacheService::builder). It nests a
//! [`StoreConfig`] for the durable tier and a [`QueueConfig`] for the
//! background refresh queue.
//!
//! [`Settings`] is the flat, millisecond-based file format. With the `cli`
//! feature it can be loaded from TOML:
//!
//! ```toml
//! fresh_window_ms = 300000
//! durable_fresh_window_ms = 1800000
//! max_entries = 1000
//! admission_delay_ms = 5000
//! fetch_timeout_ms = 30000
//! notification_coalesce_ms = 2000
//! storage_dir = "/var/cache/regcache"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryConfig;

/// Durable store policy.
///
/// `max_age` is not enforced on reads; it is the cutoff used by
/// [`DiskStore::prune`](crate::DiskStore::prune).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of records kept on disk. Default: 1,000.
    pub max_entries: usize,
    /// Age past which maintenance may drop a record. Default: 24 hours.
    pub max_age: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of records.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the maintenance age cutoff.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }
}

/// Background refresh queue policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Debounce delay before a submitted key becomes runnable. Default: 5s.
    pub admission_delay: Duration,
    /// Number of keys refreshed in parallel. Default: 1.
    pub concurrency: usize,
    /// Retry policy for failed refreshes.
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            admission_delay: Duration::from_secs(5),
            concurrency: 1,
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the admission (debounce) delay.
    pub fn admission_delay(mut self, delay: Duration) -> Self {
        self.admission_delay = delay;
        self
    }

    /// Set how many keys may be refreshed at once (minimum 1).
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Orchestrator policy.
///
/// ```rust
/// # use regcache::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .memory_fresh_window(Duration::from_secs(60))
///     .durable_fresh_window(Duration::from_secs(600));
/// assert_eq!(config.queue.admission_delay, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an in-memory entry answers without further checks. Default: 5 min.
    pub memory_fresh_window: Duration,
    /// How long a durable entry counts as fresh. Default: 30 min.
    pub durable_fresh_window: Duration,
    /// Capacity of the in-memory layer. Default: 10,000.
    pub memory_max_entries: u64,
    /// Hard timeout on every origin fetch. Default: 30s.
    pub fetch_timeout: Duration,
    /// Minimum spacing between listener notification rounds. Default: 2s.
    pub notification_coalesce: Duration,
    /// Extra delay before a notification round fires. Default: 250ms.
    pub notification_settle: Duration,
    pub store: StoreConfig,
    pub queue: QueueConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_fresh_window: Duration::from_secs(5 * 60),
            durable_fresh_window: Duration::from_secs(30 * 60),
            memory_max_entries: 10_000,
            fetch_timeout: Duration::from_secs(30),
            notification_coalesce: Duration::from_secs(2),
            notification_settle: Duration::from_millis(250),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_fresh_window(mut self, window: Duration) -> Self {
        self.memory_fresh_window = window;
        self
    }

    pub fn durable_fresh_window(mut self, window: Duration) -> Self {
        self.durable_fresh_window = window;
        self
    }

    pub fn memory_max_entries(mut self, n: u64) -> Self {
        self.memory_max_entries = n;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn notification_coalesce(mut self, window: Duration) -> Self {
        self.notification_coalesce = window;
        self
    }

    pub fn notification_settle(mut self, delay: Duration) -> Self {
        self.notification_settle = delay;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// File-level settings, all durations in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// In-memory fresh window (default: 300000).
    #[serde(default)]
    pub fresh_window_ms: Option<u64>,
    /// Durable fresh window (default: 1800000).
    #[serde(default)]
    pub durable_fresh_window_ms: Option<u64>,
    /// Durable store capacity (default: 1000).
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Refresh admission delay (default: 5000).
    #[serde(default)]
    pub admission_delay_ms: Option<u64>,
    /// Origin fetch timeout (default: 30000).
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
    /// Notification coalescing window (default: 2000).
    #[serde(default)]
    pub notification_coalesce_ms: Option<u64>,
    /// Parallel refreshes (default: 1).
    #[serde(default)]
    pub refresh_concurrency: Option<usize>,
    /// Refresh attempts including the first (default: 2).
    #[serde(default)]
    pub refresh_max_attempts: Option<u32>,
    /// Durable store directory (default: platform cache dir).
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

impl Settings {
    /// Parse settings from a TOML string.
    #[cfg(feature = "cli")]
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| {
            crate::CacheError::Configuration(format!("Failed to parse settings: {e}"))
        })
    }

    /// Load settings from a TOML file.
    #[cfg(feature = "cli")]
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::CacheError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml(&content)
    }

    /// Apply these settings on top of the defaults.
    pub fn to_config(&self) -> CacheConfig {
        let mut config = CacheConfig::default();
        if let Some(ms) = self.fresh_window_ms {
            config.memory_fresh_window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.durable_fresh_window_ms {
            config.durable_fresh_window = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_entries {
            config.store.max_entries = n;
        }
        if let Some(ms) = self.admission_delay_ms {
            config.queue.admission_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.fetch_timeout_ms {
            config.fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.notification_coalesce_ms {
            config.notification_coalesce = Duration::from_millis(ms);
        }
        if let Some(n) = self.refresh_concurrency {
            config.queue.concurrency = n.max(1);
        }
        if let Some(n) = self.refresh_max_attempts {
            config.queue.retry.max_attempts = n.max(1);
        }
        config
    }

    /// Configured storage directory, or the platform default.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(default_storage_dir)
    }
}

/// Default storage directory: `~/.cache/regcache`.
pub fn default_storage_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("regcache")
}
