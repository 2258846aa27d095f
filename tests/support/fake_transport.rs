//! In-memory `HttpTransport` serving a single resource.
//!
//! Honors `Range: bytes=a-b` with `206` when range support is on, answers
//! conditional `HEAD`s with `304` while the content is unchanged, and lets a
//! test inject one fault per request keyed by the requested start offset.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use rangefetch_core::download::{BodyStream, Conditional};
use rangefetch_core::{
    DownloadError, HttpTransport, RequestOptions, ResponseHead, TransportResponse,
};

pub const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
pub const LATER_MODIFIED: &str = "Thu, 22 Oct 2015 07:28:00 GMT";

/// Fault applied to the next request at a given start offset.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with this status and an empty body.
    Status(u16),
    /// Fail before any response.
    Timeout,
    /// Send this many bytes, then end the body early.
    CutAfter(usize),
    /// Send this many bytes, then never finish.
    StallAfter(usize),
    /// Answer a ranged request with `200` and the whole resource.
    IgnoreRange,
    /// Send this many bytes, then fail with a disk-full I/O error.
    DiskFullAfter(usize),
}

/// One request as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: &'static str,
    pub range: Option<String>,
    pub conditional: Option<Conditional>,
}

#[derive(Debug)]
struct State {
    content: Bytes,
    ranges: bool,
    chunked: bool,
    last_modified: Option<String>,
    etag: Option<String>,
    content_disposition: Option<String>,
    piece_size: usize,
    piece_delay: Duration,
    faults: HashMap<u64, VecDeque<Fault>>,
    log: Vec<LoggedRequest>,
}

#[derive(Debug)]
pub struct FakeTransport {
    state: Mutex<State>,
}

impl FakeTransport {
    /// Range-capable server with a `Last-Modified` token.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            state: Mutex::new(State {
                content: content.into(),
                ranges: true,
                chunked: false,
                last_modified: Some(LAST_MODIFIED.to_string()),
                etag: None,
                content_disposition: None,
                piece_size: 64,
                piece_delay: Duration::ZERO,
                faults: HashMap::new(),
                log: Vec::new(),
            }),
        }
    }

    pub fn without_ranges(self) -> Self {
        self.update(|s| s.ranges = false);
        self
    }

    /// No length and `Transfer-Encoding: chunked`.
    pub fn chunked(self) -> Self {
        self.update(|s| {
            s.chunked = true;
            s.ranges = false;
        });
        self
    }

    pub fn with_last_modified(self, value: Option<&str>) -> Self {
        self.update(|s| s.last_modified = value.map(str::to_string));
        self
    }

    pub fn with_etag(self, value: Option<&str>) -> Self {
        self.update(|s| s.etag = value.map(str::to_string));
        self
    }

    pub fn with_content_disposition(self, value: &str) -> Self {
        self.update(|s| s.content_disposition = Some(value.to_string()));
        self
    }

    /// Body pieces of `size` bytes, each delayed by `delay`.
    pub fn with_pieces(self, size: usize, delay: Duration) -> Self {
        self.update(|s| {
            s.piece_size = size.max(1);
            s.piece_delay = delay;
        });
        self
    }

    /// Replaces the resource and its `Last-Modified` token.
    pub fn replace_content(&self, content: impl Into<Bytes>, last_modified: &str) {
        let content = content.into();
        self.update(|s| {
            s.content = content;
            s.last_modified = Some(last_modified.to_string());
        });
    }

    /// Queues `fault` for the next GET starting at byte `start`.
    pub fn fail_at(&self, start: u64, fault: Fault) {
        self.update(|s| s.faults.entry(start).or_default().push_back(fault));
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.read(|s| s.log.clone())
    }

    /// `Range` header of every GET, in order.
    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.read(|s| {
            s.log
                .iter()
                .filter(|r| r.method == "GET")
                .map(|r| r.range.clone())
                .collect()
        })
    }

    pub fn get_count(&self) -> usize {
        self.get_ranges().len()
    }

    pub fn clear_log(&self) {
        self.update(|s| s.log.clear());
    }

    fn update(&self, f: impl FnOnce(&mut State)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn log(&self, method: &'static str, options: &RequestOptions) {
        self.update(|s| {
            s.log.push(LoggedRequest {
                method,
                range: options.range.clone(),
                conditional: options.conditional.clone(),
            });
        });
    }

    fn base_head(state: &State, status: u16) -> ResponseHead {
        let len = state.content.len() as u64;
        ResponseHead {
            status,
            content_length: (!state.chunked).then_some(len),
            transfer_encoding: state.chunked.then(|| "chunked".to_string()),
            accept_ranges: state.ranges.then(|| "bytes".to_string()),
            last_modified: state.last_modified.clone(),
            etag: state.etag.clone(),
            content_disposition: state.content_disposition.clone(),
            ..ResponseHead::default()
        }
    }
}

/// Parses `bytes=a-b` or `bytes=a-`.
fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse::<u64>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

fn body(data: Bytes, piece_size: usize, delay: Duration, stall: bool) -> BodyStream {
    let pieces: Vec<Bytes> = (0..data.len())
        .step_by(piece_size)
        .map(|at| data.slice(at..(at + piece_size).min(data.len())))
        .collect();
    let finite = stream::iter(pieces).then(move |piece| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<Bytes, DownloadError>(piece)
    });
    if stall {
        Box::pin(finite.chain(stream::pending()))
    } else {
        Box::pin(finite)
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn head(
        &self,
        _url: &str,
        options: &RequestOptions,
    ) -> Result<ResponseHead, DownloadError> {
        self.log("HEAD", options);
        Ok(self.read(|s| {
            let unchanged = match &options.conditional {
                Some(Conditional::IfModifiedSince(token)) => {
                    s.last_modified.as_deref() == Some(token.as_str())
                }
                Some(Conditional::IfNoneMatch(token)) => s.etag.as_deref() == Some(token.as_str()),
                None => false,
            };
            if unchanged {
                return ResponseHead {
                    status: 304,
                    ..ResponseHead::default()
                };
            }

            let len = s.content.len() as u64;
            let range = options.range.as_deref().filter(|_| s.ranges && !s.chunked);
            match range.and_then(|r| parse_range(r, len)) {
                Some((start, end)) => ResponseHead {
                    content_length: Some(end - start + 1),
                    content_range: Some(format!("bytes {start}-{end}/{len}")),
                    ..Self::base_head(s, 206)
                },
                None => Self::base_head(s, 200),
            }
        }))
    }

    async fn get(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<TransportResponse, DownloadError> {
        self.log("GET", options);
        let (head, data, fault, piece_size, delay) = self.read_and_take(options);

        match fault {
            Some(Fault::Timeout) => Err(DownloadError::timeout(url)),
            Some(Fault::Status(status)) => Ok(TransportResponse {
                head: ResponseHead {
                    status,
                    ..ResponseHead::default()
                },
                body: Box::pin(stream::empty()),
            }),
            Some(Fault::CutAfter(n)) => Ok(TransportResponse {
                head,
                body: body(data.slice(..n.min(data.len())), piece_size, delay, false),
            }),
            Some(Fault::StallAfter(n)) => Ok(TransportResponse {
                head,
                body: body(data.slice(..n.min(data.len())), piece_size, delay, true),
            }),
            Some(Fault::DiskFullAfter(n)) => {
                let sent = body(data.slice(..n.min(data.len())), piece_size, delay, false);
                let error = DownloadError::io(
                    "data.bin",
                    std::io::Error::other("no space left on device"),
                );
                Ok(TransportResponse {
                    head,
                    body: Box::pin(sent.chain(stream::once(async move { Err(error) }))),
                })
            }
            Some(Fault::IgnoreRange) | None => Ok(TransportResponse {
                head,
                body: body(data, piece_size, delay, false),
            }),
        }
    }
}

impl FakeTransport {
    fn read_and_take(
        &self,
        options: &RequestOptions,
    ) -> (ResponseHead, Bytes, Option<Fault>, usize, Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let len = state.content.len() as u64;
        let requested = options
            .range
            .as_deref()
            .and_then(|r| parse_range(r, len))
            .filter(|_| state.ranges);
        let key = requested.map_or(0, |(start, _)| start);
        let fault = state.faults.get_mut(&key).and_then(VecDeque::pop_front);
        let honor_range = !matches!(fault, Some(Fault::IgnoreRange));

        let (head, data) = match requested.filter(|_| honor_range) {
            Some((start, end)) => (
                ResponseHead {
                    content_length: Some(end - start + 1),
                    content_range: Some(format!("bytes {start}-{end}/{len}")),
                    ..Self::base_head(&state, 206)
                },
                state.content.slice(start as usize..=end as usize),
            ),
            None => (Self::base_head(&state, 200), state.content.clone()),
        };
        (head, data, fault, state.piece_size, state.piece_delay)
    }
}
