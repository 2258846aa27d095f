//! Repository seam for task persistence.
//!
//! The download engine depends on this trait rather than on [`TaskRegistry`]
//! so it can run against any store.

use async_trait::async_trait;

use super::{NewTask, Result, StatusUpdate, Task, TaskRegistry};

/// Data-access contract for download tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Registers a new task in `waiting` state.
    async fn add(&self, task: &NewTask<'_>) -> Result<()>;

    /// Looks a task up by URL.
    async fn find_by_url(&self, url: &str) -> Result<Option<Task>>;

    /// Records a status transition.
    async fn update_status(&self, url: &str, update: &StatusUpdate<'_>) -> Result<()>;

    /// Rewrites every mutable column of a task.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Removes a task; returns whether a row existed.
    async fn delete(&self, url: &str) -> Result<bool>;

    /// Returns every task, oldest first.
    async fn list_all(&self) -> Result<Vec<Task>>;
}

#[async_trait]
impl TaskRepository for TaskRegistry {
    async fn add(&self, task: &NewTask<'_>) -> Result<()> {
        TaskRegistry::add(self, task).await
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Task>> {
        TaskRegistry::find_by_url(self, url).await
    }

    async fn update_status(&self, url: &str, update: &StatusUpdate<'_>) -> Result<()> {
        TaskRegistry::update_status(self, url, update).await
    }

    async fn update(&self, task: &Task) -> Result<()> {
        TaskRegistry::update(self, task).await
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        TaskRegistry::delete(self, url).await
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        TaskRegistry::list_all(self).await
    }
}
