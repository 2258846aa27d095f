//! Resumable multi-connection download engine.
//!
//! Components, leaves first:
//!
//! - [`layout`] maps a save name and directory onto the final, progress and
//!   marker file paths.
//! - [`chunk_store`] owns the progress and marker files, plans chunk
//!   boundaries and performs positioned writes into the final file.
//! - [`negotiator`] probes a server for range support and for changes since
//!   a previous attempt.
//! - [`engine`] is the orchestrator: it picks single-stream or multi-chunk
//!   mode, fans out chunk workers, merges their progress and persists status
//!   transitions to the task registry.
//! - [`progress`] holds the status/progress value types and the throttled
//!   progress stream handed to callers.
//!
//! # Example
//!
//! ```no_run
//! use rangefetch_core::{Database, DownloadEngine, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("tasks.db")).await?;
//! let engine = DownloadEngine::from_database(EngineConfig::default(), db)?;
//! let task = engine.prepare("https://example.com/big.iso").await?;
//! let handle = engine.start(&task)?;
//! let last = handle.wait().await;
//! println!("finished: {last:?}");
//! # Ok(())
//! # }
//! ```

pub mod chunk_store;
mod config;
mod constants;
pub mod engine;
mod error;
mod filename;
pub mod layout;
pub mod negotiator;
pub mod progress;
mod retry;
pub mod transport;

pub use chunk_store::{ChunkRange, ChunkStore, ChunkWriter, plan_chunks};
pub use config::{ConfigError, EngineConfig};
pub use constants::{DEFAULT_THREAD_COUNT, MAX_THREAD_COUNT, TEST_RANGE_SUPPORT};
pub use engine::{DownloadControl, DownloadEngine, DownloadHandle, StopReason};
pub use error::{DownloadError, ErrorKind};
pub use filename::suggested_file_name;
pub use layout::{TaskPaths, numbered_save_name, resolve_paths};
pub use negotiator::{FreshnessProbe, Negotiator, RangeProbe, classify_range_support};
pub use progress::{DownloadStatus, ProgressSnapshot, ProgressStream, TaskFailure};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use transport::{
    BodyStream, Conditional, HttpTransport, ReqwestTransport, RequestOptions, ResponseHead,
    TransportResponse,
};
