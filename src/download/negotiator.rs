//! Range-capability and freshness probes.
//!
//! The capability probe is a `HEAD` with `Range: bytes=0-`. A server that
//! answers with a concrete length, no chunked transfer coding, and either a
//! `Content-Range` or `Accept-Ranges: bytes` is treated as range-capable.
//!
//! The freshness probe replays the stored token as `If-Modified-Since` (HTTP
//! dates) or `If-None-Match` (entity tags) on the same ranged `HEAD`.
//! `304 Not Modified` means the partial download on disk is still valid; any
//! other success also carries the resource's current capabilities.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::TEST_RANGE_SUPPORT;
use super::filename::suggested_file_name;
use super::transport::{Conditional, HttpTransport, RequestOptions, ResponseHead};
use super::DownloadError;

/// Result of the capability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeProbe {
    /// Whether chunked range downloading can be used.
    pub supports_range: bool,
    /// Full resource size, when reported.
    pub content_length: Option<u64>,
    /// `Last-Modified`, else `ETag`.
    pub freshness_token: Option<String>,
    /// Save name derived from `Content-Disposition` or the URL.
    pub suggested_file_name: String,
}

/// Result of the freshness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessProbe {
    /// True unless the server answered `304 Not Modified`.
    pub changed: bool,
    /// Status of the conditional response.
    pub status: u16,
    /// Current capabilities, present whenever `changed` is true.
    pub capabilities: Option<RangeProbe>,
}

/// Decides range support from a probe response.
///
/// Chunked transfer coding or a missing length always disables ranges, even
/// when `Accept-Ranges` is present.
#[must_use]
pub fn classify_range_support(head: &ResponseHead) -> bool {
    if head.is_chunked() || probe_length(head).is_none() {
        return false;
    }
    head.content_range.is_some()
        || head
            .accept_ranges
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// Picks the freshness token: `Last-Modified` first, then `ETag`.
#[must_use]
pub fn freshness_token(head: &ResponseHead) -> Option<String> {
    head.last_modified
        .clone()
        .or_else(|| head.etag.clone())
        .filter(|token| !token.is_empty())
}

fn probe_length(head: &ResponseHead) -> Option<u64> {
    head.content_range_total().or(head.content_length)
}

fn range_probe(url: &Url, head: &ResponseHead) -> RangeProbe {
    RangeProbe {
        supports_range: classify_range_support(head),
        content_length: probe_length(head),
        freshness_token: freshness_token(head),
        suggested_file_name: suggested_file_name(url, head.content_disposition.as_deref()),
    }
}

/// Issues capability and freshness probes through an [`HttpTransport`].
#[derive(Clone)]
pub struct Negotiator {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator").finish_non_exhaustive()
    }
}

impl Negotiator {
    /// Creates a negotiator over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Probes whether `url` can be fetched in byte ranges.
    ///
    /// # Errors
    ///
    /// - `DownloadError::InvalidUrl` when `url` does not parse
    /// - `DownloadError::HttpStatus` for a non-2xx answer
    /// - network errors from the transport
    #[instrument(skip(self))]
    pub async fn probe_range_support(&self, url: &str) -> Result<RangeProbe, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let head = self
            .transport
            .head(url, &RequestOptions::range(TEST_RANGE_SUPPORT))
            .await?;
        if !head.is_success() {
            return Err(DownloadError::http_status(url, head.status));
        }

        let probe = range_probe(&parsed, &head);
        info!(
            supports_range = probe.supports_range,
            content_length = ?probe.content_length,
            file_name = %probe.suggested_file_name,
            "probed server capabilities"
        );
        Ok(probe)
    }

    /// Asks whether `url` changed since `known_token` was recorded.
    ///
    /// # Errors
    ///
    /// - `DownloadError::InvalidUrl` when `url` does not parse
    /// - `DownloadError::HttpStatus` for answers other than 2xx and 304
    /// - network errors from the transport
    #[instrument(skip(self))]
    pub async fn probe_freshness(
        &self,
        url: &str,
        known_token: &str,
    ) -> Result<FreshnessProbe, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let options = RequestOptions {
            range: Some(TEST_RANGE_SUPPORT.to_string()),
            conditional: Some(Conditional::for_token(known_token)),
        };
        let head = self.transport.head(url, &options).await?;
        let capabilities = match head.status {
            304 => None,
            _ if head.is_success() => Some(range_probe(&parsed, &head)),
            status => return Err(DownloadError::http_status(url, status)),
        };
        let changed = capabilities.is_some();
        debug!(status = head.status, changed, "freshness probe");
        Ok(FreshnessProbe {
            changed,
            status: head.status,
            capabilities,
        })
    }
}
