//! One download run: layout, fan-out, progress merge, terminal status.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::worker::{self, ChunkEvent, ChunkOutcome, FetchMode, WorkerContext};
use super::{DownloadControl, StopReason};
use crate::download::chunk_store::{ChunkRange, ChunkStore};
use crate::download::constants::EVENT_BUFFER;
use crate::download::progress::{
    DownloadStatus, ProgressPublisher, ProgressSnapshot, TaskFailure,
};
use crate::download::transport::HttpTransport;
use crate::download::{DownloadError, EngineConfig};
use crate::registry::{StatusUpdate, Task, TaskRepository, to_db_bytes};

pub(super) struct PipelineContext {
    pub url: String,
    pub config: Arc<EngineConfig>,
    pub transport: Arc<dyn HttpTransport>,
    pub registry: Arc<dyn TaskRepository>,
    pub pool: Arc<Semaphore>,
    pub control: DownloadControl,
}

/// Chunk table and fetch mode chosen for a run.
struct Layout {
    mode: FetchMode,
    chunks: Vec<ChunkRange>,
}

impl Layout {
    fn downloaded(&self) -> u64 {
        self.chunks.iter().map(ChunkRange::written).sum()
    }

    /// Chunks that still need a worker.
    fn pending(&self) -> VecDeque<usize> {
        match self.mode {
            FetchMode::Unbounded => VecDeque::from([0]),
            FetchMode::Ranged | FetchMode::WholeFile => self
                .chunks
                .iter()
                .filter(|chunk| chunk.is_legal())
                .map(|chunk| chunk.index)
                .collect(),
        }
    }
}

/// What the workers left behind.
struct RunReport {
    written: Vec<u64>,
    failures: Vec<DownloadError>,
    completed: usize,
}

impl RunReport {
    fn downloaded(&self) -> u64 {
        self.written.iter().sum()
    }
}

struct Terminal {
    status: DownloadStatus,
    downloaded: u64,
    total: Option<u64>,
    failure: Option<TaskFailure>,
}

impl Terminal {
    fn failed(error: &DownloadError, downloaded: u64, total: Option<u64>) -> Self {
        Self {
            status: DownloadStatus::Failed,
            downloaded,
            total,
            failure: Some(TaskFailure {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }
}

/// Runs a download to its terminal status and publishes it.
#[instrument(skip_all, fields(url = %ctx.url))]
pub(super) async fn run_download(ctx: PipelineContext, publisher: ProgressPublisher) {
    let terminal = match drive(&ctx, &publisher).await {
        Ok(terminal) => terminal,
        Err(error) => {
            warn!(error = %error, "download failed before transfer");
            let current = publisher.current();
            Terminal::failed(&error, current.downloaded_bytes, current.total_bytes)
        }
    };
    finish(&ctx, publisher, terminal).await;
}

async fn drive(
    ctx: &PipelineContext,
    publisher: &ProgressPublisher,
) -> Result<Terminal, DownloadError> {
    let task = ctx
        .registry
        .find_by_url(&ctx.url)
        .await?
        .ok_or_else(|| DownloadError::task_not_found(&ctx.url))?;
    let store = Arc::new(ChunkStore::new(task.paths()?));
    let total = task.content_length();

    let before = u64::try_from(task.downloaded_bytes).unwrap_or(0);
    ctx.registry
        .update_status(&ctx.url, &StatusUpdate::new(DownloadStatus::Started, before))
        .await?;
    publisher.set_status(DownloadStatus::Started);

    let layout = plan_layout(ctx, &task, &store).await?;
    publisher.set_bytes(layout.downloaded(), total);
    info!(
        mode = ?layout.mode,
        chunks = layout.chunks.len(),
        downloaded = layout.downloaded(),
        total = ?total,
        "download started"
    );

    let report = run_workers(ctx, &store, publisher, &layout, total).await;
    decide(ctx, &task, &store, &layout, report).await
}

async fn plan_layout(
    ctx: &PipelineContext,
    task: &Task,
    store: &ChunkStore,
) -> Result<Layout, DownloadError> {
    let token = task.freshness_token.as_deref();
    let Some(length) = task.content_length().filter(|len| *len > 0) else {
        store.prepare_unbounded(token).await?;
        return Ok(Layout {
            mode: FetchMode::Unbounded,
            chunks: Vec::new(),
        });
    };
    let mode = if task.supports_range {
        FetchMode::Ranged
    } else {
        FetchMode::WholeFile
    };

    if let Some(chunks) = resumable_chunks(task, store, length).await? {
        // Without ranges only a finished table is reusable.
        if mode == FetchMode::Ranged || chunks.iter().all(ChunkRange::is_complete) {
            info!(
                resumed_bytes = chunks.iter().map(ChunkRange::written).sum::<u64>(),
                "resuming from stored progress"
            );
            return Ok(Layout { mode, chunks });
        }
    }

    let threads = match mode {
        FetchMode::Ranged => ctx.config.thread_count,
        FetchMode::WholeFile | FetchMode::Unbounded => 1,
    };
    let chunks = store.prepare_layout(length, token, threads, false).await?;
    Ok(Layout { mode, chunks })
}

/// Returns the stored chunk table when it belongs to this task's version.
async fn resumable_chunks(
    task: &Task,
    store: &ChunkStore,
    length: u64,
) -> Result<Option<Vec<ChunkRange>>, DownloadError> {
    let expected = task.freshness_token.as_deref().unwrap_or_default();
    let Some(stored) = store.read_stored_freshness_token().await? else {
        return Ok(None);
    };
    if stored != expected {
        info!("stored progress belongs to another version, restarting");
        return Ok(None);
    }
    if store.is_damaged(length).await {
        warn!("stored progress is damaged, restarting");
        return Ok(None);
    }
    match store.read_chunks().await {
        Ok(chunks) => Ok(Some(chunks)),
        Err(e) => {
            warn!(error = %e, "chunk table unreadable, restarting");
            Ok(None)
        }
    }
}

async fn run_workers(
    ctx: &PipelineContext,
    store: &Arc<ChunkStore>,
    publisher: &ProgressPublisher,
    layout: &Layout,
    total: Option<u64>,
) -> RunReport {
    let (events_tx, mut events_rx) = mpsc::channel::<ChunkEvent>(EVENT_BUFFER);
    let worker_ctx = WorkerContext {
        url: Arc::from(ctx.url.as_str()),
        transport: Arc::clone(&ctx.transport),
        store: Arc::clone(store),
        retry_policy: ctx.config.retry_policy.clone(),
        pool: Arc::clone(&ctx.pool),
        token: ctx.control.token(),
        events: events_tx,
        mode: layout.mode,
    };

    let mut report = RunReport {
        written: if layout.chunks.is_empty() {
            vec![0]
        } else {
            layout.chunks.iter().map(ChunkRange::written).collect()
        },
        failures: Vec::new(),
        completed: layout.chunks.iter().filter(|c| c.is_complete()).count(),
    };
    let mut pending = layout.pending();
    let mut workers = JoinSet::new();
    let mut next_launch = Instant::now();
    let mut last_flush = Instant::now();
    let token = ctx.control.token();

    loop {
        if workers.is_empty() && (pending.is_empty() || token.is_cancelled()) {
            break;
        }
        let launch_due = !pending.is_empty() && !token.is_cancelled();

        tokio::select! {
            () = tokio::time::sleep_until(next_launch), if launch_due => {
                if let Some(index) = pending.pop_front() {
                    debug!(chunk = index, "launching chunk worker");
                    workers.spawn(worker::fetch_chunk(worker_ctx.clone(), index));
                    next_launch = Instant::now() + ctx.config.chunk_launch_stagger;
                }
            }
            Some(event) = events_rx.recv() => {
                record_event(&mut report, event);
                publisher.set_bytes(report.downloaded(), total);
                if last_flush.elapsed() >= ctx.config.registry_flush_interval {
                    last_flush = Instant::now();
                    flush_progress(ctx, report.downloaded()).await;
                }
            }
            Some(joined) = workers.join_next() => match joined {
                Ok((index, outcome)) => record_outcome(&mut report, index, outcome),
                Err(join_error) => {
                    warn!(error = %join_error, "chunk worker aborted");
                    report.failures.push(DownloadError::WorkerAborted {
                        message: join_error.to_string(),
                    });
                }
            },
        }
    }

    drop(worker_ctx);
    while let Ok(event) = events_rx.try_recv() {
        record_event(&mut report, event);
    }
    publisher.set_bytes(report.downloaded(), total);
    report
}

fn record_event(report: &mut RunReport, event: ChunkEvent) {
    if let Some(slot) = report.written.get_mut(event.index) {
        *slot = event.written;
    }
}

fn record_outcome(report: &mut RunReport, index: usize, outcome: ChunkOutcome) {
    match outcome {
        ChunkOutcome::Completed { written } => {
            if let Some(slot) = report.written.get_mut(index) {
                *slot = written;
            }
            report.completed += 1;
        }
        ChunkOutcome::Stopped => debug!(chunk = index, "chunk worker stopped"),
        ChunkOutcome::Failed(error) => {
            warn!(chunk = index, error = %error, "chunk gave up");
            report.failures.push(error);
        }
    }
}

async fn flush_progress(ctx: &PipelineContext, downloaded: u64) {
    let update = StatusUpdate::new(DownloadStatus::Started, downloaded);
    if let Err(e) = ctx.registry.update_status(&ctx.url, &update).await {
        warn!(error = %e, "could not record progress");
    }
}

async fn decide(
    ctx: &PipelineContext,
    task: &Task,
    store: &ChunkStore,
    layout: &Layout,
    mut report: RunReport,
) -> Result<Terminal, DownloadError> {
    let downloaded = report.downloaded();
    let complete = match layout.mode {
        FetchMode::Unbounded => report.completed == 1 && report.failures.is_empty(),
        FetchMode::Ranged | FetchMode::WholeFile => match store.is_incomplete().await {
            Ok(incomplete) => {
                !incomplete && !store.is_damaged(task.content_length().unwrap_or(0)).await
            }
            Err(e) => {
                report.failures.push(e);
                false
            }
        },
    };

    if complete {
        let mut total = task.content_length();
        if layout.mode == FetchMode::Unbounded {
            let mut sized = task.clone();
            sized.content_length = Some(to_db_bytes(downloaded));
            ctx.registry.update(&sized).await?;
            total = Some(downloaded);
        }
        return Ok(Terminal {
            status: DownloadStatus::Completed,
            downloaded,
            total,
            failure: None,
        });
    }

    let total = task.content_length();
    if let Some(reason) = ctx.control.stop_reason() {
        let status = match reason {
            StopReason::Pause => DownloadStatus::Paused,
            StopReason::Cancel => DownloadStatus::Canceled,
        };
        return Ok(Terminal {
            status,
            downloaded,
            total,
            failure: None,
        });
    }

    let failed = report.failures.len();
    let mut terminal = match report.failures.first() {
        Some(first) => Terminal::failed(first, downloaded, total),
        None => Terminal::failed(
            &DownloadError::WorkerAborted {
                message: "workers stopped before the download completed".to_string(),
            },
            downloaded,
            total,
        ),
    };
    if failed > 1
        && let Some(failure) = terminal.failure.as_mut()
    {
        failure.message = format!("{failed} chunks failed; first: {}", failure.message);
    }
    Ok(terminal)
}

/// Persists the terminal status, then publishes it.
async fn finish(ctx: &PipelineContext, publisher: ProgressPublisher, terminal: Terminal) {
    let message = terminal.failure.as_ref().map(ToString::to_string);
    let mut update = StatusUpdate::new(terminal.status, terminal.downloaded);
    if let Some(message) = message.as_deref() {
        update = update.with_error(message);
    }
    if let Err(e) = ctx.registry.update_status(&ctx.url, &update).await {
        warn!(error = %e, status = %terminal.status, "could not record final status");
    }

    info!(
        status = %terminal.status,
        downloaded = terminal.downloaded,
        "download finished"
    );
    publisher.finish(ProgressSnapshot {
        status: terminal.status,
        downloaded_bytes: terminal.downloaded,
        total_bytes: terminal.total,
        failure: terminal.failure,
    });
}
