//! Single-stream engine: one connection, sequential writes, whole-transfer retry.
//!
//! Used when the server does not honour ranges, when the size is unknown, or
//! when the resource is too small to be worth splitting. A single stream has
//! no independent checkpoints, so every retry truncates the destination and
//! starts again from byte zero.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{header_content_length, read_chunk};
use super::descriptor::TransferDescriptor;
use super::error::{BlockFailure, DownloadError, EngineError};
use super::probe::ResourceMeta;
use super::progress::ProgressTracker;
use super::retry::{RetryDecision, classify_error, retry_after_delay};
use super::target::FileTarget;
use super::{DownloadStats, HttpClient};

/// Streams the whole resource into the descriptor's destination.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// - [`EngineError::Conflict`] / [`EngineError::Io`] if the destination cannot be opened
/// - [`EngineError::Cancelled`] if the token was cancelled, including during a
///   read or a backoff wait
/// - [`EngineError::Transfer`] once the retry budget is spent or a permanent error occurs
#[instrument(skip_all, fields(url = %descriptor.url(), path = %descriptor.destination().display()))]
pub(crate) async fn run(
    client: &HttpClient,
    descriptor: &TransferDescriptor,
    meta: &ResourceMeta,
    progress: &ProgressTracker,
    stats: &DownloadStats,
    cancel: &CancellationToken,
) -> Result<u64, EngineError> {
    let target = FileTarget::open(
        descriptor.destination(),
        meta.total_size.unwrap_or(0),
        descriptor.overwrite(),
    )
    .await?;
    let policy = descriptor.retry_policy();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            target.close_after_failure().await;
            return Err(EngineError::Cancelled);
        }
        if attempt > 1 {
            if let Err(e) = target.reset().await {
                target.close_after_failure().await;
                return Err(single_failure(descriptor, meta, attempt - 1, &e));
            }
        }
        debug!(attempt, "starting stream");

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = stream_once(client, descriptor, meta, &target, progress) => result,
        };
        let error = match outcome {
            Ok(bytes) => {
                target.close().await?;
                stats.increment_completed();
                info!(bytes, attempts = attempt, "single-stream download complete");
                return Ok(bytes);
            }
            Err(e) => e,
        };

        if matches!(error, DownloadError::Cancelled) || cancel.is_cancelled() {
            target.close_after_failure().await;
            return Err(EngineError::Cancelled);
        }

        match policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                let delay = retry_after_delay(&error).unwrap_or(delay);
                info!(
                    attempt = next,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying stream from the beginning"
                );
                stats.increment_retried();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => debug!("cancelled during backoff"),
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(attempts = attempt, %reason, error = %error, "stream failed");
                stats.increment_failed();
                target.close_after_failure().await;
                return Err(single_failure(descriptor, meta, attempt, &error));
            }
        }
    }
}

async fn stream_once(
    client: &HttpClient,
    descriptor: &TransferDescriptor,
    meta: &ResourceMeta,
    target: &FileTarget,
    progress: &ProgressTracker,
) -> Result<u64, DownloadError> {
    let url = descriptor.url().as_str();
    let response = client.get(descriptor).await?;
    let expected = meta.total_size.or_else(|| header_content_length(&response));

    let chunk_size = descriptor.chunk_size();
    let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut offset = 0u64;
    let mut received = 0u64;
    let mut stream = std::pin::pin!(response.bytes_stream());

    while let Some(chunk) = read_chunk(&mut stream, url, descriptor.timeout()).await? {
        received += chunk.len() as u64;
        if let Some(expected) = expected
            && received > expected
        {
            return Err(DownloadError::short_read(url, expected, received));
        }

        buffer.extend_from_slice(&chunk);
        if buffer.len() >= chunk_size {
            offset = flush(target, offset, &mut buffer, chunk_size, progress).await?;
        }
    }

    if !buffer.is_empty() {
        offset = flush(target, offset, &mut buffer, chunk_size, progress).await?;
    }

    if let Some(expected) = expected
        && offset != expected
    {
        return Err(DownloadError::short_read(url, expected, offset));
    }
    Ok(offset)
}

async fn flush(
    target: &FileTarget,
    offset: u64,
    buffer: &mut Vec<u8>,
    chunk_size: usize,
    progress: &ProgressTracker,
) -> Result<u64, DownloadError> {
    let data = std::mem::replace(buffer, Vec::with_capacity(chunk_size));
    let len = data.len() as u64;
    target.write_at(offset, data).await?;
    let position = offset + len;
    progress.advance_to(position);
    Ok(position)
}

fn single_failure(
    descriptor: &TransferDescriptor,
    meta: &ResourceMeta,
    attempts: u32,
    error: &DownloadError,
) -> EngineError {
    EngineError::Transfer {
        url: descriptor.url().to_string(),
        failures: vec![BlockFailure {
            index: 0,
            stream: true,
            start: 0,
            end: meta.total_size.and_then(|size| size.checked_sub(1)),
            attempts,
            error: error.to_string(),
        }],
    }
}
