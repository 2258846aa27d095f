//! Chunk worker: fetches one chunk with retries, writing through a [`ChunkWriter`].

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::chunk_store::{ChunkStore, ChunkWriter};
use crate::download::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::download::transport::{HttpTransport, RequestOptions};
use crate::download::DownloadError;

/// How a worker requests its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FetchMode {
    /// `Range: bytes=<current>-<end>`; the server must answer 206.
    Ranged,
    /// Plain GET into a single known-length chunk; restarts from zero on retry.
    WholeFile,
    /// Plain GET of unknown length, appended until the body ends.
    Unbounded,
}

/// Progress report from a worker: bytes written so far within its chunk.
#[derive(Debug, Clone, Copy)]
pub(super) struct ChunkEvent {
    pub index: usize,
    pub written: u64,
}

/// Final result of one worker.
#[derive(Debug)]
pub(super) enum ChunkOutcome {
    Completed { written: u64 },
    Stopped,
    Failed(DownloadError),
}

/// Everything a worker needs; cheap to clone per chunk.
#[derive(Clone)]
pub(super) struct WorkerContext {
    pub url: Arc<str>,
    pub transport: Arc<dyn HttpTransport>,
    pub store: Arc<ChunkStore>,
    pub retry_policy: RetryPolicy,
    pub pool: Arc<Semaphore>,
    pub token: CancellationToken,
    pub events: mpsc::Sender<ChunkEvent>,
    pub mode: FetchMode,
}

enum FetchEnd {
    Complete,
    Stopped,
}

/// Fetches chunk `index` until it completes, is stopped, or exhausts retries.
#[instrument(skip(ctx), fields(url = %ctx.url, mode = ?ctx.mode))]
pub(super) async fn fetch_chunk(ctx: WorkerContext, index: usize) -> (usize, ChunkOutcome) {
    let permit = tokio::select! {
        permit = Arc::clone(&ctx.pool).acquire_owned() => permit,
        () = ctx.token.cancelled() => return (index, ChunkOutcome::Stopped),
    };
    let Ok(_permit) = permit else {
        return (index, ChunkOutcome::Stopped);
    };

    let writer = match ctx.mode {
        FetchMode::Ranged | FetchMode::WholeFile => ctx.store.open_writer(index).await,
        FetchMode::Unbounded => ctx.store.open_unbounded_writer().await,
    };
    let mut writer = match writer {
        Ok(writer) => writer,
        Err(e) => return (index, ChunkOutcome::Failed(e)),
    };

    let outcome = run_attempts(&ctx, &mut writer).await;
    (index, outcome)
}

async fn run_attempts(ctx: &WorkerContext, writer: &mut ChunkWriter) -> ChunkOutcome {
    let index = writer.index();
    if writer.is_complete() {
        return ChunkOutcome::Completed {
            written: writer.written(),
        };
    }
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if ctx.token.is_cancelled() {
            return ChunkOutcome::Stopped;
        }
        debug!(chunk = index, attempt, offset = writer.offset(), "requesting chunk");

        let error = match fetch_once(ctx, writer).await {
            Ok(FetchEnd::Complete) => {
                debug!(chunk = index, written = writer.written(), "chunk complete");
                return ChunkOutcome::Completed {
                    written: writer.written(),
                };
            }
            Ok(FetchEnd::Stopped) => return ChunkOutcome::Stopped,
            Err(e) => e,
        };

        match ctx.retry_policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    chunk = index,
                    attempt = next_attempt,
                    max_attempts = ctx.retry_policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    resume_from = writer.offset(),
                    error = %error,
                    "retrying chunk"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.token.cancelled() => return ChunkOutcome::Stopped,
                }
                if ctx.mode != FetchMode::Ranged {
                    if let Err(e) = writer.rewind().await {
                        return ChunkOutcome::Failed(e);
                    }
                    report(ctx, writer).await;
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(chunk = index, %reason, error = %error, "chunk failed");
                return ChunkOutcome::Failed(error);
            }
        }
    }
}

async fn fetch_once(
    ctx: &WorkerContext,
    writer: &mut ChunkWriter,
) -> Result<FetchEnd, DownloadError> {
    let options = match ctx.mode {
        FetchMode::Ranged => writer
            .range_header()
            .map(RequestOptions::range)
            .unwrap_or_default(),
        FetchMode::WholeFile | FetchMode::Unbounded => RequestOptions::default(),
    };

    let response = tokio::select! {
        response = ctx.transport.get(&ctx.url, &options) => response?,
        () = ctx.token.cancelled() => return Ok(FetchEnd::Stopped),
    };

    let status = response.head.status;
    match ctx.mode {
        FetchMode::Ranged if status != 206 => {
            if response.head.is_success() {
                return Err(DownloadError::protocol_unsupported(
                    ctx.url.as_ref(),
                    format!("ranged request answered with {status}"),
                ));
            }
            return Err(DownloadError::http_status(ctx.url.as_ref(), status));
        }
        FetchMode::Ranged => {
            check_content_range(ctx, writer, response.head.content_range.as_deref())?;
        }
        FetchMode::WholeFile | FetchMode::Unbounded if !response.head.is_success() => {
            return Err(DownloadError::http_status(ctx.url.as_ref(), status));
        }
        FetchMode::WholeFile | FetchMode::Unbounded => {}
    }

    let mut body = response.body;
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.token.cancelled() => return Ok(FetchEnd::Stopped),
            next = body.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                writer.write(&bytes).await?;
                report(ctx, writer).await;
                if writer.is_complete() {
                    return Ok(FetchEnd::Complete);
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    match writer.end() {
        None => Ok(FetchEnd::Complete),
        Some(_) if writer.is_complete() => Ok(FetchEnd::Complete),
        Some(end) => Err(DownloadError::incomplete_body(
            ctx.url.as_ref(),
            end,
            writer.offset(),
        )),
    }
}

/// A 206 must start where the chunk left off.
fn check_content_range(
    ctx: &WorkerContext,
    writer: &ChunkWriter,
    content_range: Option<&str>,
) -> Result<(), DownloadError> {
    let Some(value) = content_range else {
        return Ok(());
    };
    let start = value
        .trim()
        .strip_prefix("bytes ")
        .and_then(|rest| rest.split_once('-'))
        .and_then(|(start, _)| start.trim().parse::<u64>().ok());
    match start {
        Some(start) if start == writer.offset() => Ok(()),
        _ => Err(DownloadError::protocol_unsupported(
            ctx.url.as_ref(),
            format!("expected range from {}, got {value}", writer.offset()),
        )),
    }
}

async fn report(ctx: &WorkerContext, writer: &ChunkWriter) {
    let event = ChunkEvent {
        index: writer.index(),
        written: writer.written(),
    };
    // The aggregator outlives every worker; a closed channel only happens on abort.
    let _ = ctx.events.send(event).await;
}
