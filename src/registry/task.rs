//! Task row types.

use std::path::Path;

use serde::Serialize;
use sqlx::FromRow;

use super::RegistryError;
use crate::download::{DownloadError, DownloadStatus, TaskPaths, resolve_paths};

/// One registered download, keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Task {
    /// Resource URL; unique.
    pub url: String,
    /// File name under `save_dir`; empty until the first probe names it.
    pub save_name: String,
    /// Directory the final file is written to.
    pub save_dir: String,
    /// `Last-Modified` or `ETag` captured at probe time.
    pub freshness_token: Option<String>,
    /// Whether the server accepted range requests at probe time.
    pub supports_range: bool,
    /// Resource size at probe time, when known.
    pub content_length: Option<i64>,
    /// Lifecycle state (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    /// Bytes persisted at the last registry flush.
    pub downloaded_bytes: i64,
    /// Failure description of the last failed run.
    pub last_error: Option<String>,
    /// When the task was registered.
    pub created_at: String,
    /// When the row last changed.
    pub updated_at: String,
}

impl Task {
    /// Parses the stored status.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidStatus`] for unknown values.
    pub fn status(&self) -> Result<DownloadStatus, RegistryError> {
        self.status_str
            .parse()
            .map_err(|_| RegistryError::InvalidStatus(self.status_str.clone()))
    }

    /// True once the task has a usable save name.
    #[must_use]
    pub fn has_save_name(&self) -> bool {
        !self.save_name.is_empty()
    }

    /// Content length as unsigned, when known.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length.and_then(|len| u64::try_from(len).ok())
    }

    /// Resolves the task's file locations.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::InvalidPath` when the save name is unusable.
    pub fn paths(&self) -> Result<TaskPaths, DownloadError> {
        resolve_paths(&self.save_name, Path::new(&self.save_dir))
    }
}

/// Values for registering a task.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    /// Resource URL.
    pub url: &'a str,
    /// File name under `save_dir`.
    pub save_name: &'a str,
    /// Target directory.
    pub save_dir: &'a str,
    /// Freshness token from the probe.
    pub freshness_token: Option<&'a str>,
    /// Range support from the probe.
    pub supports_range: bool,
    /// Size from the probe.
    pub content_length: Option<u64>,
}

/// Values written on a status transition.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate<'a> {
    /// New status.
    pub status: DownloadStatus,
    /// Bytes persisted so far.
    pub downloaded_bytes: u64,
    /// Failure description; cleared when `None`.
    pub last_error: Option<&'a str>,
}

impl<'a> StatusUpdate<'a> {
    /// A transition without failure details.
    #[must_use]
    pub fn new(status: DownloadStatus, downloaded_bytes: u64) -> Self {
        Self {
            status,
            downloaded_bytes,
            last_error: None,
        }
    }

    /// Attaches a failure description.
    #[must_use]
    pub fn with_error(mut self, error: &'a str) -> Self {
        self.last_error = Some(error);
        self
    }
}

/// Converts a byte count for storage; SQLite integers are signed.
pub(crate) fn to_db_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
