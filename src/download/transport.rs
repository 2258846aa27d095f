//! HTTP seam used by the negotiator and the chunk workers.
//!
//! [`HttpTransport`] returns every status as-is; interpreting 206 versus
//! 200 versus 304 is the caller's business. Only connection-level failures
//! become errors here.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, HeaderName,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RANGE, TRANSFER_ENCODING,
};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Response body as a stream of byte chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Conditional request header derived from a freshness token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional {
    /// `If-Modified-Since: <http-date>`
    IfModifiedSince(String),
    /// `If-None-Match: <etag>`
    IfNoneMatch(String),
}

impl Conditional {
    /// Chooses the header for `token`: HTTP dates become `If-Modified-Since`,
    /// anything else is treated as an entity tag.
    #[must_use]
    pub fn for_token(token: &str) -> Self {
        if httpdate::parse_http_date(token).is_ok() {
            Self::IfModifiedSince(token.to_string())
        } else {
            Self::IfNoneMatch(token.to_string())
        }
    }
}

/// Optional request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Raw `Range` header value, e.g. `bytes=250-499`.
    pub range: Option<String>,
    /// Conditional header.
    pub conditional: Option<Conditional>,
}

impl RequestOptions {
    /// Options carrying only a `Range` header.
    #[must_use]
    pub fn range(value: impl Into<String>) -> Self {
        Self {
            range: Some(value.into()),
            conditional: None,
        }
    }

    /// Options carrying only a conditional header.
    #[must_use]
    pub fn conditional(conditional: Conditional) -> Self {
        Self {
            range: None,
            conditional: Some(conditional),
        }
    }
}

/// Status and the headers the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Length`, parsed.
    pub content_length: Option<u64>,
    /// `Content-Range`, raw.
    pub content_range: Option<String>,
    /// `Accept-Ranges`, raw.
    pub accept_ranges: Option<String>,
    /// `Transfer-Encoding`, raw.
    pub transfer_encoding: Option<String>,
    /// `Last-Modified`, raw.
    pub last_modified: Option<String>,
    /// `ETag`, raw.
    pub etag: Option<String>,
    /// `Content-Disposition`, raw.
    pub content_disposition: Option<String>,
}

impl ResponseHead {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Total resource size from `Content-Range: bytes a-b/total`, if numeric.
    #[must_use]
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.content_range.as_deref()?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    /// Returns true when the body uses chunked transfer coding.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.transfer_encoding
            .as_deref()
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Builds a head from a header map.
    #[must_use]
    pub fn from_headers(status: u16, headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        Self {
            status,
            content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_range: text(CONTENT_RANGE),
            accept_ranges: text(ACCEPT_RANGES),
            transfer_encoding: text(TRANSFER_ENCODING),
            last_modified: text(LAST_MODIFIED),
            etag: text(ETAG),
            content_disposition: text(CONTENT_DISPOSITION),
        }
    }
}

/// A response whose body has not been read yet.
pub struct TransportResponse {
    /// Status and headers.
    pub head: ResponseHead,
    /// Body stream; dropping it aborts the transfer.
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Issues HEAD and GET requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a HEAD request.
    async fn head(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<ResponseHead, DownloadError>;

    /// Sends a GET request and returns before the body is consumed.
    async fn get(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<TransportResponse, DownloadError>;
}

/// [`HttpTransport`] over a pooled reqwest client.
///
/// Content-coding is never negotiated, so byte offsets in responses always
/// match offsets in the stored file.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Builds a transport with the default timeouts (30s connect, 300s read).
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to initialise.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Builds a transport with explicit timeouts in seconds.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to initialise.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    fn apply(request: RequestBuilder, options: &RequestOptions) -> RequestBuilder {
        let mut request = request;
        if let Some(range) = &options.range {
            request = request.header(RANGE, range);
        }
        match &options.conditional {
            Some(Conditional::IfModifiedSince(date)) => {
                request = request.header(IF_MODIFIED_SINCE, date);
            }
            Some(Conditional::IfNoneMatch(tag)) => request = request.header(IF_NONE_MATCH, tag),
            None => {}
        }
        request
    }

    async fn send(url: &str, request: RequestBuilder) -> Result<reqwest::Response, DownloadError> {
        request.send().await.map_err(|e| map_reqwest_error(url, e))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, options), fields(range = ?options.range))]
    async fn head(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<ResponseHead, DownloadError> {
        let request = Self::apply(self.client.head(url), options);
        let response = Self::send(url, request).await?;
        let head = ResponseHead::from_headers(response.status().as_u16(), response.headers());
        debug!(status = head.status, "HEAD response");
        Ok(head)
    }

    #[instrument(skip(self, options), fields(range = ?options.range))]
    async fn get(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<TransportResponse, DownloadError> {
        let request = Self::apply(self.client.get(url), options);
        let response = Self::send(url, request).await?;
        let head = ResponseHead::from_headers(response.status().as_u16(), response.headers());
        debug!(status = head.status, "GET response");

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |item| item.map_err(|e| map_reqwest_error(&owned_url, e)));
        Ok(TransportResponse {
            head,
            body: Box::pin(body),
        })
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn default_user_agent() -> String {
    format!("rangefetch/{}", env!("CARGO_PKG_VERSION"))
}
