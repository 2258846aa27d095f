//! Download orchestrator.
//!
//! [`DownloadEngine`] turns a URL into a registered [`Task`] (`prepare`) and
//! runs it (`start`). A run picks one of three modes:
//!
//! - **ranged**: the server supports ranges and reported a length; the file
//!   is split into `thread_count` chunks fetched concurrently and resumable
//!   from their persisted offsets;
//! - **whole file**: a length is known but ranges are not; one plain GET,
//!   restarted from byte zero on any retry;
//! - **unbounded**: no length (chunked transfer coding); one plain GET
//!   appended until the body ends.
//!
//! Chunk workers share one semaphore-limited pool across every download the
//! engine runs. Status transitions are written to the [`TaskRepository`]
//! before they are published on the progress stream.

mod pipeline;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::negotiator::{Negotiator, RangeProbe};
use super::progress::{DownloadStatus, ProgressPublisher, ProgressSnapshot, ProgressStream};
use super::transport::{HttpTransport, ReqwestTransport};
use super::{
    ChunkStore, ConfigError, DownloadError, EngineConfig, TaskPaths, numbered_save_name,
    resolve_paths,
};
use crate::db::Database;
use crate::registry::{NewTask, StatusUpdate, Task, TaskRegistry, TaskRepository};

use pipeline::PipelineContext;

/// Why a download was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep files and resume later.
    Pause,
    /// Stop for good; files are kept until the task is deleted.
    Cancel,
}

const REASON_NONE: u8 = 0;
const REASON_PAUSE: u8 = 1;
const REASON_CANCEL: u8 = 2;

/// Stop switch shared by a download's handle(s) and its workers.
#[derive(Debug, Clone, Default)]
pub struct DownloadControl {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl DownloadControl {
    /// Requests a pause. Has no effect after a cancel.
    pub fn pause(&self) {
        let _ = self.reason.compare_exchange(
            REASON_NONE,
            REASON_PAUSE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.token.cancel();
    }

    /// Requests a cancel; overrides an earlier pause.
    pub fn cancel(&self) {
        self.reason.store(REASON_CANCEL, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Returns the stop request, if any.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            REASON_PAUSE => Some(StopReason::Pause),
            REASON_CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    /// True once a pause or cancel was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Caller's view of a running download.
#[derive(Debug)]
pub struct DownloadHandle {
    url: String,
    control: DownloadControl,
    progress: ProgressStream,
}

impl DownloadHandle {
    /// URL being downloaded.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests a pause.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Requests a cancel.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Returns a stop switch usable after the handle is consumed.
    #[must_use]
    pub fn control(&self) -> DownloadControl {
        self.control.clone()
    }

    /// Borrows the progress stream.
    pub fn progress(&mut self) -> &mut ProgressStream {
        &mut self.progress
    }

    /// Consumes the handle, keeping only the progress stream.
    #[must_use]
    pub fn into_progress(self) -> ProgressStream {
        self.progress
    }

    /// Waits for the terminal snapshot.
    pub async fn wait(self) -> Option<ProgressSnapshot> {
        self.progress.wait().await
    }
}

#[derive(Debug, Clone)]
struct RunningDownload {
    started_at: Instant,
    control: DownloadControl,
    progress: watch::Receiver<ProgressSnapshot>,
}

impl RunningDownload {
    fn launch(task: &Task) -> (Self, ProgressPublisher) {
        let initial = ProgressSnapshot::new(
            DownloadStatus::Waiting,
            u64::try_from(task.downloaded_bytes).unwrap_or(0),
            task.content_length(),
        );
        let (publisher, progress) = ProgressPublisher::new(initial);
        let run = Self {
            started_at: Instant::now(),
            control: DownloadControl::default(),
            progress,
        };
        (run, publisher)
    }

    fn is_finished(&self) -> bool {
        self.progress.borrow().is_terminal()
    }

    /// True for a run that ended on its own less than `start_debounce` ago.
    /// A run stopped by pause or cancel never absorbs the next start.
    fn is_debouncing(&self, config: &EngineConfig) -> bool {
        self.control.stop_reason().is_none() && self.started_at.elapsed() < config.start_debounce
    }

    fn attach(&self, url: &str, config: &EngineConfig) -> DownloadHandle {
        DownloadHandle {
            url: url.to_string(),
            control: self.control.clone(),
            progress: ProgressStream::follow(self.progress.clone(), config.progress_interval),
        }
    }

    async fn wait_finished(&self) {
        let mut progress = self.progress.clone();
        let _ = progress.wait_for(ProgressSnapshot::is_terminal).await;
    }
}

/// Resumable multi-connection download engine.
pub struct DownloadEngine {
    config: Arc<EngineConfig>,
    transport: Arc<dyn HttpTransport>,
    negotiator: Negotiator,
    registry: Arc<dyn TaskRepository>,
    pool: Arc<Semaphore>,
    running: DashMap<String, RunningDownload>,
    registering: Mutex<()>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("config", &self.config)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Creates an engine over an HTTP transport and a task repository.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        registry: Arc<dyn TaskRepository>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = Arc::new(Semaphore::new(config.effective_pool_size()));
        Ok(Self {
            negotiator: Negotiator::new(Arc::clone(&transport)),
            config: Arc::new(config),
            transport,
            registry,
            pool,
            running: DashMap::new(),
            registering: Mutex::new(()),
        })
    }

    /// Creates an engine using reqwest and the `SQLite` registry in `db`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation or the HTTP
    /// client cannot be built.
    pub fn from_database(config: EngineConfig, db: Database) -> Result<Self, ConfigError> {
        let transport =
            ReqwestTransport::with_timeouts(config.connect_timeout_secs, config.read_timeout_secs)
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Self::new(config, Arc::new(transport), Arc::new(TaskRegistry::new(db)))
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the task for `url`, registering it first if needed.
    ///
    /// An existing task is checked for freshness: if the server reports a
    /// change, its files and row are discarded and the URL is registered anew.
    ///
    /// # Errors
    ///
    /// - `DownloadError::InvalidUrl` for malformed URLs
    /// - `DownloadError::InvalidPath` when the derived save name is unusable
    /// - probe and registry errors
    #[instrument(skip(self))]
    pub async fn prepare(&self, url: &str) -> Result<Task, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let Some(task) = self.registry.find_by_url(url).await? else {
            return self.register(url).await;
        };
        if self.is_running(url) {
            debug!("download running, keeping task");
            return Ok(task);
        }
        if !task.has_save_name() {
            self.registry.delete(url).await?;
            return self.register(url).await;
        }
        if let Some(probe) = self.stale_probe(&task).await? {
            info!("remote content changed, discarding stored download");
            self.delete(url).await?;
            return self.register_probed(url, probe).await;
        }
        if task.status()? == DownloadStatus::Started {
            // Left behind by a process that stopped mid-download.
            let downloaded = u64::try_from(task.downloaded_bytes).unwrap_or(0);
            self.registry
                .update_status(url, &StatusUpdate::new(DownloadStatus::Paused, downloaded))
                .await?;
            return self
                .registry
                .find_by_url(url)
                .await?
                .ok_or_else(|| DownloadError::task_not_found(url));
        }
        Ok(task)
    }

    /// Starts (or resumes) `task` and returns a handle to its progress.
    ///
    /// A start for a URL whose download is still running, or that began less
    /// than `start_debounce` ago and was not paused or canceled, attaches to
    /// that download instead of launching another.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::InvalidPath` when the task's save name is unusable.
    #[instrument(skip(self, task), fields(url = %task.url))]
    pub fn start(&self, task: &Task) -> Result<DownloadHandle, DownloadError> {
        task.paths()?;

        let (run, publisher) = match self.running.entry(task.url.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.is_finished() || existing.is_debouncing(&self.config) {
                    debug!("attaching to existing download");
                    return Ok(existing.attach(&task.url, &self.config));
                }
                let (run, publisher) = RunningDownload::launch(task);
                entry.insert(run.clone());
                (run, publisher)
            }
            Entry::Vacant(entry) => {
                let (run, publisher) = RunningDownload::launch(task);
                entry.insert(run.clone());
                (run, publisher)
            }
        };

        let ctx = PipelineContext {
            url: task.url.clone(),
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            pool: Arc::clone(&self.pool),
            control: run.control.clone(),
        };
        tokio::spawn(pipeline::run_download(ctx, publisher));
        info!("download launched");

        Ok(run.attach(&task.url, &self.config))
    }

    /// Pauses the running download of `url`. Returns false if none is running.
    pub fn pause(&self, url: &str) -> bool {
        self.active(url).is_some_and(|run| {
            run.control.pause();
            true
        })
    }

    /// Cancels the running download of `url`. Returns false if none is running.
    pub fn cancel(&self, url: &str) -> bool {
        self.active(url).is_some_and(|run| {
            run.control.cancel();
            true
        })
    }

    /// Returns the registered task for `url`.
    ///
    /// # Errors
    ///
    /// Registry errors.
    pub async fn task(&self, url: &str) -> Result<Option<Task>, DownloadError> {
        Ok(self.registry.find_by_url(url).await?)
    }

    /// Returns the file locations of the task for `url`.
    ///
    /// # Errors
    ///
    /// Registry errors, or `DownloadError::InvalidPath` for an unusable save name.
    pub async fn files(&self, url: &str) -> Result<Option<TaskPaths>, DownloadError> {
        match self.registry.find_by_url(url).await? {
            Some(task) if task.has_save_name() => Ok(Some(task.paths()?)),
            _ => Ok(None),
        }
    }

    /// Stops any running download of `url`, then removes its files and row.
    ///
    /// Deleting an unknown URL is a no-op.
    ///
    /// # Errors
    ///
    /// File removal or registry errors.
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str) -> Result<(), DownloadError> {
        if let Some((_, run)) = self.running.remove(url) {
            run.control.cancel();
            run.wait_finished().await;
        }

        let Some(task) = self.registry.find_by_url(url).await? else {
            return Ok(());
        };
        if task.has_save_name() {
            ChunkStore::new(task.paths()?).remove_files().await?;
        }
        self.registry.delete(url).await?;
        info!("task deleted");
        Ok(())
    }

    /// Deletes every registered task.
    ///
    /// # Errors
    ///
    /// The first failure; tasks before it are already deleted.
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<usize, DownloadError> {
        let tasks = self.registry.list_all().await?;
        for task in &tasks {
            self.delete(&task.url).await?;
        }
        Ok(tasks.len())
    }

    /// Returns every registered task.
    ///
    /// # Errors
    ///
    /// Registry errors.
    pub async fn list(&self) -> Result<Vec<Task>, DownloadError> {
        Ok(self.registry.list_all().await?)
    }

    fn active(&self, url: &str) -> Option<RunningDownload> {
        self.running
            .get(url)
            .map(|entry| entry.value().clone())
            .filter(|run| !run.is_finished())
    }

    fn is_running(&self, url: &str) -> bool {
        self.active(url).is_some()
    }

    async fn register(&self, url: &str) -> Result<Task, DownloadError> {
        let probe = self.negotiator.probe_range_support(url).await?;
        self.register_probed(url, probe).await
    }

    async fn register_probed(&self, url: &str, probe: RangeProbe) -> Result<Task, DownloadError> {
        resolve_paths(&probe.suggested_file_name, &self.config.save_dir)?;

        let save_dir = self.config.save_dir.to_string_lossy();
        // Held until the row exists so two registrations cannot pick the same name.
        let _claim = self.registering.lock().await;
        let save_name = self
            .unclaimed_save_name(&probe.suggested_file_name, &save_dir)
            .await?;
        self.registry
            .add(&NewTask {
                url,
                save_name: &save_name,
                save_dir: &save_dir,
                freshness_token: probe.freshness_token.as_deref(),
                supports_range: probe.supports_range,
                content_length: probe.content_length,
            })
            .await?;
        info!(
            save_name = %save_name,
            supports_range = probe.supports_range,
            "task registered"
        );
        self.registry
            .find_by_url(url)
            .await?
            .ok_or_else(|| DownloadError::task_not_found(url))
    }

    /// First of `name`, `name (1)`, ... not used by another task in `save_dir`.
    async fn unclaimed_save_name(
        &self,
        suggested: &str,
        save_dir: &str,
    ) -> Result<String, DownloadError> {
        let taken: HashSet<String> = self
            .registry
            .list_all()
            .await?
            .into_iter()
            .filter(|task| task.save_dir == save_dir)
            .map(|task| task.save_name)
            .collect();
        let save_name = (0..=taken.len())
            .map(|n| numbered_save_name(suggested, n))
            .find(|name| !taken.contains(name))
            .unwrap_or_else(|| suggested.to_string());
        if save_name != suggested {
            debug!(suggested, save_name = %save_name, "save name already taken");
        }
        Ok(save_name)
    }

    /// Current capabilities of `task`'s resource when it changed since the
    /// task was registered, `None` while the stored download is still valid.
    async fn stale_probe(&self, task: &Task) -> Result<Option<RangeProbe>, DownloadError> {
        let Some(token) = task.freshness_token.as_deref().filter(|t| !t.is_empty()) else {
            let probe = self.negotiator.probe_range_support(&task.url).await?;
            let changed = probe.content_length != task.content_length()
                || probe.supports_range != task.supports_range;
            return Ok(changed.then_some(probe));
        };
        Ok(self
            .negotiator
            .probe_freshness(&task.url, token)
            .await?
            .capabilities)
    }
}
