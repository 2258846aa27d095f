//! Task registry: the durable record of every download, keyed by URL.
//!
//! - [`TaskRegistry`] - `SQLite`-backed implementation
//! - [`TaskRepository`] - trait the download engine depends on
//! - [`Task`] - registry row
//! - [`RegistryError`] - operation error types
//!
//! # Example
//!
//! ```no_run
//! use rangefetch_core::{Database, DownloadStatus, NewTask, StatusUpdate, TaskRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let registry = TaskRegistry::new(db);
//! registry
//!     .add(&NewTask {
//!         url: "https://example.com/a.iso",
//!         save_name: "a.iso",
//!         save_dir: "downloads",
//!         freshness_token: None,
//!         supports_range: true,
//!         content_length: Some(1_000),
//!     })
//!     .await?;
//! registry
//!     .update_status(
//!         "https://example.com/a.iso",
//!         &StatusUpdate::new(DownloadStatus::Started, 0),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod repository;
mod task;

pub use error::{RegistryDbErrorKind, RegistryError};
pub use repository::TaskRepository;
pub use task::{NewTask, StatusUpdate, Task};

pub(crate) use task::to_db_bytes;

use tracing::instrument;

use crate::db::Database;
use crate::download::DownloadStatus;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`RegistryError::TaskNotFound`].
fn check_affected(url: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(RegistryError::TaskNotFound(url.to_string()))
    } else {
        Ok(())
    }
}

const TASK_COLUMNS: &str = "url, save_name, save_dir, freshness_token, supports_range, \
     content_length, status, downloaded_bytes, last_error, created_at, updated_at";

/// `SQLite`-backed task registry.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    db: Database,
}

impl TaskRegistry {
    /// Creates a registry over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a task in `waiting` state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] with a constraint-violation kind if
    /// the URL is already registered.
    #[instrument(skip(self, task), fields(url = %task.url))]
    pub async fn add(&self, task: &NewTask<'_>) -> Result<()> {
        sqlx::query(
            r"INSERT INTO tasks
                (url, save_name, save_dir, freshness_token, supports_range, content_length, status)
              VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.url)
        .bind(task.save_name)
        .bind(task.save_dir)
        .bind(task.freshness_token)
        .bind(task.supports_range)
        .bind(task.content_length.map(to_db_bytes))
        .bind(DownloadStatus::Waiting.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Looks a task up by URL.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn find_by_url(&self, url: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Records a status transition with the current byte count.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TaskNotFound`] if no task has this URL.
    #[instrument(skip(self, update), fields(status = %update.status))]
    pub async fn update_status(&self, url: &str, update: &StatusUpdate<'_>) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?,
                  downloaded_bytes = ?,
                  last_error = ?,
                  updated_at = datetime('now')
              WHERE url = ?",
        )
        .bind(update.status.as_str())
        .bind(to_db_bytes(update.downloaded_bytes))
        .bind(update.last_error)
        .bind(url)
        .execute(self.db.pool())
        .await?;

        check_affected(url, result.rows_affected())
    }

    /// Rewrites every mutable column of `task`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TaskNotFound`] if no task has this URL.
    #[instrument(skip(self, task), fields(url = %task.url))]
    pub async fn update(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET save_name = ?,
                  save_dir = ?,
                  freshness_token = ?,
                  supports_range = ?,
                  content_length = ?,
                  status = ?,
                  downloaded_bytes = ?,
                  last_error = ?,
                  updated_at = datetime('now')
              WHERE url = ?",
        )
        .bind(&task.save_name)
        .bind(&task.save_dir)
        .bind(&task.freshness_token)
        .bind(task.supports_range)
        .bind(task.content_length)
        .bind(&task.status_str)
        .bind(task.downloaded_bytes)
        .bind(&task.last_error)
        .bind(&task.url)
        .execute(self.db.pool())
        .await?;

        check_affected(&task.url, result.rows_affected())
    }

    /// Removes a task. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE url = ?")
            .bind(url)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns every task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, rowid"
        ))
        .fetch_all(self.db.pool())
        .await?;
        Ok(tasks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/file.bin";

    async fn registry() -> TaskRegistry {
        TaskRegistry::new(Database::new_in_memory().await.unwrap())
    }

    fn new_task(url: &str) -> NewTask<'_> {
        NewTask {
            url,
            save_name: "file.bin",
            save_dir: "/tmp/dl",
            freshness_token: Some("Wed, 21 Oct 2015 07:28:00 GMT"),
            supports_range: true,
            content_length: Some(1000),
        }
    }

    #[tokio::test]
    async fn test_add_then_find() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();

        let task = registry.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(task.save_name, "file.bin");
        assert_eq!(task.status().unwrap(), DownloadStatus::Waiting);
        assert!(task.supports_range);
        assert_eq!(task.content_length(), Some(1000));
        assert_eq!(task.downloaded_bytes, 0);
        assert!(task.has_save_name());
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let registry = registry().await;
        assert!(registry.find_by_url(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_duplicate_url_is_constraint_violation() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();
        let err = registry.add(&new_task(URL)).await.unwrap_err();
        assert!(err.is_duplicate(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_update_status_records_bytes_and_error() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();

        registry
            .update_status(
                URL,
                &StatusUpdate::new(DownloadStatus::Failed, 250).with_error("io_write: disk full"),
            )
            .await
            .unwrap();

        let task = registry.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(task.status().unwrap(), DownloadStatus::Failed);
        assert_eq!(task.downloaded_bytes, 250);
        assert_eq!(task.last_error.as_deref(), Some("io_write: disk full"));

        registry
            .update_status(URL, &StatusUpdate::new(DownloadStatus::Started, 250))
            .await
            .unwrap();
        let task = registry.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(task.last_error, None);
    }

    #[tokio::test]
    async fn test_update_status_missing_task() {
        let registry = registry().await;
        let err = registry
            .update_status(URL, &StatusUpdate::new(DownloadStatus::Paused, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TaskNotFound(url) if url == URL));
    }

    #[tokio::test]
    async fn test_update_rewrites_probe_fields() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();

        let mut task = registry.find_by_url(URL).await.unwrap().unwrap();
        task.content_length = Some(2048);
        task.freshness_token = Some("\"etag\"".to_string());
        task.supports_range = false;
        registry.update(&task).await.unwrap();

        let stored = registry.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(stored.content_length(), Some(2048));
        assert_eq!(stored.freshness_token.as_deref(), Some("\"etag\""));
        assert!(!stored.supports_range);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();

        assert!(registry.delete(URL).await.unwrap());
        assert!(!registry.delete(URL).await.unwrap());
        assert!(registry.find_by_url(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_all_in_insertion_order() {
        let registry = registry().await;
        registry.add(&new_task("https://a.example/1")).await.unwrap();
        registry.add(&new_task("https://a.example/2")).await.unwrap();

        let urls: Vec<String> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["https://a.example/1", "https://a.example/2"]);
    }

    #[tokio::test]
    async fn test_task_paths_resolve_under_save_dir() {
        let registry = registry().await;
        registry.add(&new_task(URL)).await.unwrap();
        let task = registry.find_by_url(URL).await.unwrap().unwrap();

        let paths = task.paths().unwrap();
        assert_eq!(paths.final_path, std::path::PathBuf::from("/tmp/dl/file.bin"));
    }
}
