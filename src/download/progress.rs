//! Download status and the throttled progress stream.
//!
//! Each running download owns a [`ProgressPublisher`], a keep-latest slot
//! that the orchestrator overwrites as bytes arrive. Callers observe it
//! through a [`ProgressStream`], fed by a forwarder task that emits at most
//! one non-terminal snapshot per interval. The terminal snapshot is never
//! throttled and is always the last item a stream yields.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::ErrorKind;

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Registered, never started or restarted from scratch.
    Waiting,
    /// Chunk workers are running.
    Started,
    /// Stopped on request; files are kept for resume.
    Paused,
    /// At least one chunk gave up.
    Failed,
    /// Every byte has been written.
    Completed,
    /// Stopped on request by a cancel.
    Canceled,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Returns true for states that end a download run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Failed | Self::Completed | Self::Canceled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "started" => Ok(Self::Started),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Why a download ended in [`DownloadStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Point-in-time view of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Current status.
    pub status: DownloadStatus,
    /// Bytes persisted so far across all chunks.
    pub downloaded_bytes: u64,
    /// Total size when the server reported one.
    pub total_bytes: Option<u64>,
    /// Failure details when `status` is `Failed`.
    pub failure: Option<TaskFailure>,
}

impl ProgressSnapshot {
    /// Creates a snapshot without failure details.
    #[must_use]
    pub fn new(status: DownloadStatus, downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status,
            downloaded_bytes,
            total_bytes,
            failure: None,
        }
    }

    /// Returns true when this snapshot ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completion ratio in percent, when the total is known and non-zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.downloaded_bytes as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// Write side of a download's progress slot.
///
/// Dropping a publisher that never published a terminal snapshot publishes a
/// `Failed` one, so every stream still ends with a terminal item.
#[derive(Debug)]
pub(crate) struct ProgressPublisher {
    tx: watch::Sender<ProgressSnapshot>,
    finished: bool,
}

impl ProgressPublisher {
    /// Creates the slot holding `initial`.
    pub(crate) fn new(initial: ProgressSnapshot) -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                tx,
                finished: false,
            },
            rx,
        )
    }

    /// Returns a copy of the latest snapshot.
    pub(crate) fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Publishes a new status, keeping the byte counters.
    pub(crate) fn set_status(&self, status: DownloadStatus) {
        self.tx.send_modify(|snapshot| snapshot.status = status);
    }

    /// Publishes new byte counters, keeping the status.
    pub(crate) fn set_bytes(&self, downloaded_bytes: u64, total_bytes: Option<u64>) {
        self.tx.send_if_modified(|snapshot| {
            let changed =
                snapshot.downloaded_bytes != downloaded_bytes || snapshot.total_bytes != total_bytes;
            snapshot.downloaded_bytes = downloaded_bytes;
            snapshot.total_bytes = total_bytes;
            changed
        });
    }

    /// Publishes the terminal snapshot and closes the slot.
    pub(crate) fn finish(mut self, terminal: ProgressSnapshot) {
        debug_assert!(terminal.is_terminal());
        self.finished = true;
        self.tx.send_replace(terminal);
    }
}

impl Drop for ProgressPublisher {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("download ended without a final status");
        self.tx.send_modify(|snapshot| {
            snapshot.status = DownloadStatus::Failed;
            snapshot.failure = Some(TaskFailure {
                kind: ErrorKind::Internal,
                message: "download ended without a final status".to_string(),
            });
        });
    }
}

/// Throttled sequence of progress snapshots for one download.
///
/// Implements [`Stream`]; the last item is always terminal. Intermediate
/// snapshots may be skipped when the consumer is slower than the publisher.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressSnapshot>,
}

impl ProgressStream {
    /// Spawns a forwarder that relays `source` no faster than once per `interval`.
    pub(crate) fn follow(source: watch::Receiver<ProgressSnapshot>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(forward(source, tx, interval));
        Self { rx }
    }

    /// Receives the next snapshot, or `None` after the terminal one.
    pub async fn recv(&mut self) -> Option<ProgressSnapshot> {
        self.rx.recv().await
    }

    /// Drains the stream and returns its last snapshot.
    pub async fn wait(mut self) -> Option<ProgressSnapshot> {
        let mut last = None;
        while let Some(snapshot) = self.rx.recv().await {
            last = Some(snapshot);
        }
        last
    }
}

impl Stream for ProgressStream {
    type Item = ProgressSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn forward(
    mut source: watch::Receiver<ProgressSnapshot>,
    sink: mpsc::Sender<ProgressSnapshot>,
    interval: Duration,
) {
    // The value present at subscription time has not been emitted yet.
    let mut pending = true;
    loop {
        if !pending && source.changed().await.is_err() {
            return;
        }
        let snapshot = source.borrow_and_update().clone();
        pending = false;
        let terminal = snapshot.is_terminal();
        if sink.send(snapshot).await.is_err() {
            debug!("progress consumer dropped");
            return;
        }
        if terminal {
            return;
        }

        let window = tokio::time::sleep(interval);
        tokio::pin!(window);
        loop {
            tokio::select! {
                () = &mut window => break,
                changed = source.changed() => {
                    if changed.is_err() {
                        // Publisher gone; the final value has been observed already.
                        return;
                    }
                    pending = true;
                    if source.borrow().is_terminal() {
                        break;
                    }
                }
            }
        }
    }
}
