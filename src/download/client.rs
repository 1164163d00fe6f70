//! HTTP client wrapper for probe, ranged, and full requests.
//!
//! [`HttpClient`] is created once and shared by every worker of a transfer
//! (cloning is cheap and shares the connection pool). Caller headers and the
//! timeout come from the [`TransferDescriptor`] of each call.
//!
//! The timeout bounds waiting, not transferring: it limits how long a request
//! may wait for response headers and how long a body may go without
//! delivering a chunk (see `read_chunk`). A large body that keeps arriving
//! never times out.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, instrument};

use super::constants::CONNECT_TIMEOUT_SECS;
use super::descriptor::TransferDescriptor;
use super::error::DownloadError;
use crate::user_agent;

/// HTTP client used by the prober and both engines.
///
/// # Example
///
/// ```no_run
/// use funget::download::{HttpClient, TransferDescriptor, TransferOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let descriptor = TransferDescriptor::new(
///     "https://example.com/file.bin",
///     "./file.bin",
///     &TransferOptions::default(),
/// )?;
/// let response = client.get_range(&descriptor, 0, 1023).await?;
/// assert_eq!(response.status().as_u16(), 206);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default connect timeout and User-Agent.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client with an explicit connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialised.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Sends a metadata-only HEAD request.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] on transport failure or non-success status.
    #[instrument(level = "debug", skip(self, descriptor), fields(url = %descriptor.url()))]
    pub async fn head(&self, descriptor: &TransferDescriptor) -> Result<Response, DownloadError> {
        self.send(Method::HEAD, descriptor, None).await
    }

    /// Sends a plain GET for the whole resource.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] on transport failure or non-success status.
    #[instrument(level = "debug", skip(self, descriptor), fields(url = %descriptor.url()))]
    pub async fn get(&self, descriptor: &TransferDescriptor) -> Result<Response, DownloadError> {
        self.send(Method::GET, descriptor, None).await
    }

    /// Sends a ranged GET for `[start, end]` and checks that the server
    /// answered with exactly that span.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::RangeNotHonoured`] if the response is not a
    /// 206 whose `Content-Range` matches, or the usual transport/status errors.
    #[instrument(level = "debug", skip(self, descriptor), fields(url = %descriptor.url()))]
    pub async fn get_range(
        &self,
        descriptor: &TransferDescriptor,
        start: u64,
        end: u64,
    ) -> Result<Response, DownloadError> {
        let range = format!("bytes={start}-{end}");
        let response = self.send(Method::GET, descriptor, Some(&range)).await?;
        let url = descriptor.url().as_str();

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::range_not_honoured(
                url,
                start,
                end,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }

        match content_range(&response) {
            Some(span) if span.start == start && span.end == end => Ok(response),
            Some(span) => Err(DownloadError::range_not_honoured(
                url,
                start,
                end,
                format!("Content-Range {}-{}", span.start, span.end),
            )),
            None => Err(DownloadError::range_not_honoured(
                url,
                start,
                end,
                "missing Content-Range",
            )),
        }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        method: Method,
        descriptor: &TransferDescriptor,
        range_header: Option<&str>,
    ) -> Result<Response, DownloadError> {
        let url = descriptor.url().as_str();
        let mut request = self
            .client
            .request(method, descriptor.url().clone())
            .headers(descriptor.headers().clone());
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }

        let response = tokio::time::timeout(descriptor.timeout(), request.send())
            .await
            .map_err(|_| DownloadError::timeout(url))?
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            debug!(status = status.as_u16(), "request rejected");
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Waits for the next body chunk, giving up after `idle` without one.
///
/// Returns `Ok(None)` at the end of the body.
///
/// # Errors
///
/// Returns [`DownloadError::Timeout`] when no chunk arrives within `idle`,
/// or the mapped transport error.
pub(crate) async fn read_chunk<S, T>(
    stream: &mut S,
    url: &str,
    idle: Duration,
) -> Result<Option<T>, DownloadError>
where
    S: Stream<Item = Result<T, reqwest::Error>> + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Err(_) => {
            debug!(idle_ms = idle.as_millis(), "body stalled");
            Err(DownloadError::timeout(url))
        }
        Ok(None) => Ok(None),
        Ok(Some(chunk)) => chunk
            .map(Some)
            .map_err(|e| DownloadError::from_reqwest(url, e)),
    }
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte in the response.
    pub start: u64,
    /// Last byte in the response, inclusive.
    pub end: u64,
    /// Complete length, if the server stated it.
    pub total: Option<u64>,
}

/// Parses a `Content-Range` value such as `bytes 0-499/1234` or `bytes 0-0/*`.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        value => Some(value.parse::<u64>().ok()?),
    };
    if total.is_some_and(|total| end >= total) {
        return None;
    }
    Some(ContentRange { start, end, total })
}

/// Reads and parses the `Content-Range` header of a response.
#[must_use]
pub fn content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

/// Reads the `Content-Length` header directly.
///
/// `Response::content_length` reflects the body, which is always empty for
/// HEAD responses, so the header is parsed instead.
#[must_use]
pub fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
