//! Constants for the download module (timeouts, pacing, on-disk naming).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Range header sent by the capability probe.
pub const TEST_RANGE_SUPPORT: &str = "bytes=0-";

/// Default number of chunks a range-capable download is split into.
pub const DEFAULT_THREAD_COUNT: usize = 3;

/// Upper bound on chunks per download.
pub const MAX_THREAD_COUNT: usize = 32;

/// Repeated starts of one URL inside this window collapse into one download.
pub const START_DEBOUNCE: Duration = Duration::from_millis(500);

/// Delay between launching successive chunk requests.
pub const CHUNK_LAUNCH_STAGGER: Duration = Duration::from_millis(200);

/// Minimum spacing between non-terminal progress snapshots.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between byte-counter writes to the task registry.
pub const REGISTRY_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Hidden directory under the save directory holding progress and marker files.
pub const CACHE_DIR: &str = ".cache";

/// Suffix of the per-task progress file.
pub const PROGRESS_SUFFIX: &str = ".tmp";

/// Suffix of the per-task freshness marker file.
pub const MARKER_SUFFIX: &str = ".lmf";

/// Capacity of the chunk-worker to aggregator event channel.
pub const EVENT_BUFFER: usize = 64;
