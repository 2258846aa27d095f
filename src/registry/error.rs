//! Error types for task registry operations.

use std::fmt;

use thiserror::Error;

/// Structured classification for registry database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique, check, not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl RegistryDbErrorKind {
    /// Classifies a sqlx error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for RegistryDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> RegistryDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return RegistryDbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return RegistryDbErrorKind::ConstraintViolation;
    }

    if database_error
        .message()
        .to_ascii_lowercase()
        .contains("database is locked")
    {
        return RegistryDbErrorKind::BusyOrLocked;
    }

    RegistryDbErrorKind::Other
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Database operation failed.
    #[error("registry database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: RegistryDbErrorKind,
        /// Database error text.
        message: String,
    },

    /// No task row for the URL.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A stored status string is not a known status.
    #[error("invalid stored status '{0}'")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: RegistryDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl RegistryError {
    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<RegistryDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::TaskNotFound(_) | Self::InvalidStatus(_) => None,
        }
    }

    /// Returns true when a task with the same URL already exists.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.database_kind() == Some(RegistryDbErrorKind::ConstraintViolation)
    }
}
