//! Error types for the download module.
//!
//! Every failure a caller can observe maps onto one [`ErrorKind`], which is
//! what the progress stream and the task registry record. The full
//! [`DownloadError`] keeps the context (URL, path, status) for logs.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::registry::RegistryError;

/// Coarse failure category surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The save name cannot be turned into a safe path under the save directory.
    InvalidPath,
    /// The server refused or mangled a range request it claimed to support.
    ProtocolUnsupported,
    /// The progress or marker file is unreadable or inconsistent.
    CorruptedState,
    /// Connection failure, timeout or a body that ended early.
    TransientNetwork,
    /// Local file system failure while writing data or metadata.
    IoWrite,
    /// The remote resource changed while a download depended on it.
    ServerContentChanged,
    /// The server answered with an unexpected HTTP status.
    Http,
    /// The URL could not be parsed.
    InvalidUrl,
    /// The task registry failed.
    Registry,
    /// A chunk worker ended abnormally.
    Internal,
}

impl ErrorKind {
    /// Returns the snake_case name used in logs and the registry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPath => "invalid_path",
            Self::ProtocolUnsupported => "protocol_unsupported",
            Self::CorruptedState => "corrupted_state",
            Self::TransientNetwork => "transient_network",
            Self::IoWrite => "io_write",
            Self::ServerContentChanged => "server_content_changed",
            Self::Http => "http",
            Self::InvalidUrl => "invalid_url",
            Self::Registry => "registry",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while probing, laying out or downloading a resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The save name is empty, escapes the save directory or is otherwise unusable.
    #[error("invalid save name {name:?}: {reason}")]
    InvalidPath {
        /// The rejected save name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A ranged request was not honoured.
    #[error("range requests unsupported by {url}: {reason}")]
    ProtocolUnsupported {
        /// The URL being fetched.
        url: String,
        /// What the server did instead.
        reason: String,
    },

    /// Persisted download metadata cannot be trusted.
    #[error("corrupted download state in {path}: {reason}")]
    CorruptedState {
        /// The metadata file.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The response body ended before the requested range was filled.
    #[error("connection to {url} closed at byte {received}, expected through byte {expected}")]
    IncompleteBody {
        /// The URL being fetched.
        url: String,
        /// Last byte offset the request asked for (inclusive).
        expected: u64,
        /// Offset reached when the body ended.
        received: u64,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The resource was modified between probe and fetch.
    #[error("content of {url} changed on the server")]
    ServerContentChanged {
        /// The URL whose content changed.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// No task is registered for the URL.
    #[error("no task registered for {url}")]
    TaskNotFound {
        /// The URL that was looked up.
        url: String,
    },

    /// The task registry failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A chunk worker panicked or was aborted.
    #[error("chunk worker ended abnormally: {message}")]
    WorkerAborted {
        /// Description of the join failure.
        message: String,
    },
}

impl DownloadError {
    /// Returns the failure category for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::ProtocolUnsupported { .. } => ErrorKind::ProtocolUnsupported,
            Self::CorruptedState { .. } => ErrorKind::CorruptedState,
            Self::Network { .. } | Self::Timeout { .. } | Self::IncompleteBody { .. } => {
                ErrorKind::TransientNetwork
            }
            Self::Io { .. } => ErrorKind::IoWrite,
            Self::ServerContentChanged { .. } => ErrorKind::ServerContentChanged,
            Self::HttpStatus { .. } => ErrorKind::Http,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::TaskNotFound { .. } | Self::Registry(_) => ErrorKind::Registry,
            Self::WorkerAborted { .. } => ErrorKind::Internal,
        }
    }

    /// Creates an invalid save name error.
    pub fn invalid_path(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            name: name.into(),
            reason,
        }
    }

    /// Creates a range-not-honoured error.
    pub fn protocol_unsupported(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolUnsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a corrupted metadata error.
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptedState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a short-body error.
    pub fn incomplete_body(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::IncompleteBody {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a content-changed error.
    pub fn content_changed(url: impl Into<String>) -> Self {
        Self::ServerContentChanged { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a missing task error.
    pub fn task_not_found(url: impl Into<String>) -> Self {
        Self::TaskNotFound { url: url.into() }
    }
}

// Source errors carry no URL or path, so there are no From impls for
// reqwest::Error or std::io::Error; use the constructors above.
