//! Rangefetch Core Library
//!
//! A resumable, multi-connection HTTP download engine. A resource is split
//! into byte-range chunks fetched concurrently when the server supports range
//! requests; per-chunk write offsets are persisted next to the download so an
//! interrupted transfer resumes without re-fetching completed bytes.
//!
//! # Architecture
//!
//! - [`download`] - protocol negotiation, chunk store, orchestration engine
//! - [`registry`] - task registry interface and its SQLite implementation
//! - [`db`] - database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod registry;
#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{
    ChunkRange, ChunkStore, ChunkWriter, ConfigError, DEFAULT_MAX_RETRIES, DEFAULT_THREAD_COUNT,
    DownloadControl, DownloadEngine, DownloadError, DownloadHandle, DownloadStatus, EngineConfig,
    ErrorKind, FailureType, FreshnessProbe, HttpTransport, MAX_THREAD_COUNT, Negotiator,
    ProgressSnapshot, ProgressStream, RangeProbe, ReqwestTransport, RequestOptions, ResponseHead,
    RetryDecision, RetryPolicy, StopReason, TaskFailure, TaskPaths, TransportResponse,
    classify_error, classify_range_support, numbered_save_name, plan_chunks, resolve_paths,
};
pub use registry::{
    NewTask, RegistryDbErrorKind, RegistryError, StatusUpdate, Task, TaskRegistry, TaskRepository,
};
