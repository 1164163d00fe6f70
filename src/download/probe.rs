//! Capability prober: resolves size and range support before any write.

use reqwest::{Method, StatusCode};
use tracing::{debug, info, instrument, warn};

use super::HttpClient;
use super::client::{content_range, header_content_length};
use super::descriptor::TransferDescriptor;
use super::error::EngineError;

/// What the server told us about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMeta {
    /// Total size in bytes; `None` when the server did not say.
    pub total_size: Option<u64>,
    /// Whether byte-range requests are honoured. Always false without a size.
    pub supports_range: bool,
}

impl ResourceMeta {
    /// Metadata for a resource of known size.
    #[must_use]
    pub fn new(total_size: Option<u64>, supports_range: bool) -> Self {
        Self {
            total_size,
            supports_range: supports_range && total_size.is_some(),
        }
    }
}

/// Resolves [`ResourceMeta`] for a descriptor.
///
/// 1. `HEAD` must succeed; its `Content-Length` gives the size.
/// 2. `GET` with `Range: bytes=0-0`: a 206 whose `Content-Range` is
///    `bytes 0-0/<total>` confirms range support. Anything else (a 200, a
///    mismatching or missing Content-Range, a failed request) denies it. When
///    HEAD gave no length, the `<total>` from the Content-Range is used.
///
/// Nothing here is retried.
///
/// # Errors
///
/// Returns [`EngineError::Resolution`] if the HEAD request fails or returns
/// a non-success status.
#[instrument(skip(client, descriptor), fields(url = %descriptor.url()))]
pub async fn probe(
    client: &HttpClient,
    descriptor: &TransferDescriptor,
) -> Result<ResourceMeta, EngineError> {
    let url = descriptor.url().as_str();

    let head = client
        .head(descriptor)
        .await
        .map_err(|e| EngineError::resolution(url, e))?;
    let head_size = header_content_length(&head);
    debug!(?head_size, "HEAD resolved");

    let (range_ok, range_total) = probe_range(client, descriptor, head_size).await;

    let total_size = head_size.or(range_total);
    let meta = ResourceMeta::new(total_size, range_ok);
    info!(
        total_size = ?meta.total_size,
        supports_range = meta.supports_range,
        "resource probed"
    );
    Ok(meta)
}

async fn probe_range(
    client: &HttpClient,
    descriptor: &TransferDescriptor,
    head_size: Option<u64>,
) -> (bool, Option<u64>) {
    let request = client
        .inner()
        .request(Method::GET, descriptor.url().clone())
        .headers(descriptor.headers().clone())
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send();
    let response = match tokio::time::timeout(descriptor.timeout(), request).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "range probe failed; assuming no range support");
            return (false, None);
        }
        Err(_) => {
            warn!("range probe timed out; assuming no range support");
            return (false, None);
        }
    };

    if response.status() != StatusCode::PARTIAL_CONTENT {
        debug!(status = response.status().as_u16(), "range probe not answered with 206");
        return (false, None);
    }

    let Some(span) = content_range(&response) else {
        debug!("range probe returned 206 without a usable Content-Range");
        return (false, None);
    };

    let matches_request = span.start == 0 && span.end == 0;
    let consistent_total = match (head_size, span.total) {
        (Some(head), Some(total)) => head == total,
        _ => true,
    };
    if !matches_request || !consistent_total {
        debug!(?span, ?head_size, "range probe Content-Range does not match request");
        return (false, None);
    }

    (true, span.total)
}

/// Returns true when a HEAD request for the descriptor's URL succeeds.
#[instrument(skip(client, descriptor), fields(url = %descriptor.url()))]
pub async fn validate_url(client: &HttpClient, descriptor: &TransferDescriptor) -> bool {
    match client.head(descriptor).await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "URL validation failed");
            false
        }
    }
}
