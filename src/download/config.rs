//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::RetryPolicy;
use super::constants::{
    CHUNK_LAUNCH_STAGGER, CONNECT_TIMEOUT_SECS, DEFAULT_THREAD_COUNT, MAX_THREAD_COUNT,
    PROGRESS_INTERVAL, READ_TIMEOUT_SECS, REGISTRY_FLUSH_INTERVAL, START_DEBOUNCE,
};

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Chunk count outside `1..=MAX_THREAD_COUNT`.
    #[error("thread count must be between 1 and {max}, got {value}")]
    InvalidThreadCount {
        /// The rejected value.
        value: usize,
        /// Upper bound.
        max: usize,
    },

    /// Worker pool of zero permits.
    #[error("worker pool size must be at least 1")]
    EmptyWorkerPool,

    /// Save directory path is empty.
    #[error("save directory must not be empty")]
    EmptySaveDir,

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Settings shared by every download an engine runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory receiving final files; progress files go to its `.cache/`.
    pub save_dir: PathBuf,
    /// Chunks a range-capable download is split into.
    pub thread_count: usize,
    /// Permits of the shared worker pool; `None` means `thread_count`.
    pub worker_pool_size: Option<usize>,
    /// Per-chunk retry behaviour.
    pub retry_policy: RetryPolicy,
    /// Window in which a repeated start attaches to the running download.
    pub start_debounce: Duration,
    /// Delay between successive chunk launches.
    pub chunk_launch_stagger: Duration,
    /// Minimum spacing of non-terminal progress snapshots.
    pub progress_interval: Duration,
    /// Minimum spacing of byte-counter writes to the registry.
    pub registry_flush_interval: Duration,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("downloads"),
            thread_count: DEFAULT_THREAD_COUNT,
            worker_pool_size: None,
            retry_policy: RetryPolicy::default(),
            start_debounce: START_DEBOUNCE,
            chunk_launch_stagger: CHUNK_LAUNCH_STAGGER,
            progress_interval: PROGRESS_INTERVAL,
            registry_flush_interval: REGISTRY_FLUSH_INTERVAL,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Sets the save directory.
    #[must_use]
    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    /// Sets the chunk count.
    #[must_use]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Sets the shared worker pool size.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the repeated-start debounce window.
    #[must_use]
    pub fn with_start_debounce(mut self, window: Duration) -> Self {
        self.start_debounce = window;
        self
    }

    /// Sets the chunk launch stagger.
    #[must_use]
    pub fn with_chunk_launch_stagger(mut self, stagger: Duration) -> Self {
        self.chunk_launch_stagger = stagger;
        self
    }

    /// Sets the progress throttle interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets how often byte counters are written to the registry.
    #[must_use]
    pub fn with_registry_flush_interval(mut self, interval: Duration) -> Self {
        self.registry_flush_interval = interval;
        self
    }

    /// Permits in the shared worker pool.
    #[must_use]
    pub fn effective_pool_size(&self) -> usize {
        self.worker_pool_size.unwrap_or(self.thread_count)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 || self.thread_count > MAX_THREAD_COUNT {
            return Err(ConfigError::InvalidThreadCount {
                value: self.thread_count,
                max: MAX_THREAD_COUNT,
            });
        }
        if self.effective_pool_size() == 0 {
            return Err(ConfigError::EmptyWorkerPool);
        }
        if self.save_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptySaveDir);
        }
        Ok(())
    }
}
