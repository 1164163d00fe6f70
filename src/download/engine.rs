//! Download orchestration: probe, pick a strategy, run it, verify the result.
//!
//! [`Downloader`] owns the pieces that outlive a single transfer (HTTP
//! client, progress observer, cancellation token). The free functions [`download`],
//! [`multi_block_download`] and [`single_stream_download`] build a default
//! downloader for one-off use.
//!
//! # Example
//!
//! ```no_run
//! use funget::download::{TransferOptions, download};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = TransferOptions {
//!     worker_limit: 8,
//!     ..TransferOptions::default()
//! };
//! let report = download("https://example.com/big.iso", "./big.iso", &options).await?;
//! println!("{} bytes via {:?} ({} retries)", report.bytes, report.strategy, report.retries);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::descriptor::{TransferDescriptor, TransferOptions};
use super::error::EngineError;
use super::probe::{ResourceMeta, probe, validate_url};
use super::progress::{ProgressObserver, ProgressTracker};
use super::target::{FileTarget, ensure_parent_dir};
use super::{HttpClient, multi, single};

/// How a transfer is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One GET, sequential writes, whole-transfer retry.
    SingleStream,
    /// Concurrent ranged GETs with per-block retry.
    MultiBlock,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleStream => f.write_str("single-stream"),
            Self::MultiBlock => f.write_str("multi-block"),
        }
    }
}

/// Which strategy the caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Decide from the probe result and size threshold.
    #[default]
    Auto,
    /// Prefer blocks whenever the server supports ranges, regardless of size.
    MultiBlock,
    /// Always stream.
    SingleStream,
}

/// Picks the strategy for a probed resource.
///
/// Multi-block requires range support, a known size, and at least
/// `min_multi_size` bytes; everything else streams.
#[must_use]
pub fn select_strategy(meta: &ResourceMeta, descriptor: &TransferDescriptor) -> Strategy {
    match meta.total_size {
        Some(size) if meta.supports_range && size >= descriptor.min_multi_size() => {
            Strategy::MultiBlock
        }
        _ => Strategy::SingleStream,
    }
}

fn resolve_strategy(mode: Mode, meta: &ResourceMeta, descriptor: &TransferDescriptor) -> Strategy {
    match mode {
        Mode::Auto => select_strategy(meta, descriptor),
        Mode::SingleStream => Strategy::SingleStream,
        Mode::MultiBlock if meta.supports_range => Strategy::MultiBlock,
        Mode::MultiBlock => {
            warn!("server does not support byte ranges; falling back to a single stream");
            Strategy::SingleStream
        }
    }
}

/// Counters for one transfer.
///
/// Workers update these concurrently, so every field is atomic. "Completed"
/// and "failed" count units of work: blocks for the multi-block engine, the
/// whole stream for the single-stream engine.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Units that finished successfully.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Units that reached the failed state.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made across all units.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Where the file was written.
    pub path: PathBuf,
    /// Bytes in the finished file.
    pub bytes: u64,
    /// Strategy that ran; `None` for an empty resource written directly.
    pub strategy: Option<Strategy>,
    /// Planned block count (0 unless multi-block).
    pub blocks: usize,
    /// Retry attempts made.
    pub retries: usize,
}

/// Probe summary for a descriptor, without downloading anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Resource URL.
    pub url: String,
    /// Destination path.
    pub path: PathBuf,
    /// Destination file name.
    pub file_name: String,
    /// Size reported by the server, if any.
    pub file_size: Option<u64>,
    /// Whether an existing destination would be replaced.
    pub overwrite: bool,
}

/// Runs downloads with an optional progress observer and a cancellation token.
///
/// The token is shared: cancelling it (for example from a Ctrl-C handler)
/// stops every transfer running on this downloader with
/// [`EngineError::Cancelled`], interrupting in-flight reads and retry waits.
#[derive(Clone)]
pub struct Downloader {
    client: HttpClient,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("client", &self.client)
            .field("has_observer", &self.observer.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(HttpClient::new())
    }
}

impl Downloader {
    /// Creates a downloader using `client` for every request.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the progress observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle to the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cancellation of every running transfer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Probes size and range support.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolution`] if the HEAD request fails.
    pub async fn probe(&self, descriptor: &TransferDescriptor) -> Result<ResourceMeta, EngineError> {
        probe(&self.client, descriptor).await
    }

    /// Returns true when the descriptor's URL answers a HEAD request.
    pub async fn validate_url(&self, descriptor: &TransferDescriptor) -> bool {
        validate_url(&self.client, descriptor).await
    }

    /// Describes what a download of `descriptor` would fetch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolution`] if the HEAD request fails.
    pub async fn file_info(&self, descriptor: &TransferDescriptor) -> Result<FileInfo, EngineError> {
        let meta = self.probe(descriptor).await?;
        Ok(FileInfo {
            url: descriptor.url().to_string(),
            path: descriptor.destination().to_path_buf(),
            file_name: descriptor.file_name(),
            file_size: meta.total_size,
            overwrite: descriptor.overwrite(),
        })
    }

    /// Downloads with automatic strategy selection.
    ///
    /// # Errors
    ///
    /// See [`EngineError`]. Partially written files are left in place.
    pub async fn download(
        &self,
        descriptor: &TransferDescriptor,
    ) -> Result<DownloadReport, EngineError> {
        self.download_with(descriptor, Mode::Auto).await
    }

    /// Downloads with an explicit [`Mode`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::Conflict`] if the destination exists and overwrite is off
    /// - [`EngineError::Resolution`] if the probe fails
    /// - [`EngineError::Transfer`] if a block or the stream exhausted its retries
    /// - [`EngineError::Integrity`] if the finished file has the wrong size
    /// - [`EngineError::Cancelled`] if the token was cancelled
    #[instrument(skip(self, descriptor), fields(url = %descriptor.url(), path = %descriptor.destination().display()))]
    pub async fn download_with(
        &self,
        descriptor: &TransferDescriptor,
        mode: Mode,
    ) -> Result<DownloadReport, EngineError> {
        let path = descriptor.destination();
        if !descriptor.overwrite() && tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(EngineError::Conflict {
                path: path.to_path_buf(),
            });
        }
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let meta = self.probe(descriptor).await?;
        if descriptor.create_dirs() {
            ensure_parent_dir(path).await?;
        }

        if meta.total_size == Some(0) {
            debug!("empty resource; writing empty file");
            FileTarget::open(path, 0, descriptor.overwrite())
                .await?
                .close()
                .await?;
            return Ok(DownloadReport {
                path: path.to_path_buf(),
                bytes: 0,
                strategy: None,
                blocks: 0,
                retries: 0,
            });
        }

        let strategy = resolve_strategy(mode, &meta, descriptor);
        info!(%strategy, total_size = ?meta.total_size, "strategy selected");

        let progress = ProgressTracker::new(meta.total_size, self.observer.clone());
        let stats = Arc::new(DownloadStats::new());

        let outcome = match (strategy, meta.total_size) {
            (Strategy::MultiBlock, Some(total)) => multi::run(
                &self.client,
                Arc::new(descriptor.clone()),
                total,
                &progress,
                Arc::clone(&stats),
                self.cancel.clone(),
            )
            .await
            .map(|blocks| (total, blocks)),
            _ => single::run(
                &self.client,
                descriptor,
                &meta,
                &progress,
                &stats,
                &self.cancel,
            )
            .await
            .map(|bytes| (bytes, 0)),
        };
        let (bytes, blocks) = match outcome {
            Ok(done) => done,
            Err(e) => {
                warn!(
                    completed = stats.completed(),
                    failed = stats.failed(),
                    retried = stats.retried(),
                    error = %e,
                    "download did not complete"
                );
                return Err(e);
            }
        };

        verify_size(path, meta.total_size).await?;

        let report = DownloadReport {
            path: path.to_path_buf(),
            bytes,
            strategy: Some(strategy),
            blocks,
            retries: stats.retried(),
        };
        info!(
            bytes = report.bytes,
            blocks = report.blocks,
            retries = report.retries,
            "download complete"
        );
        Ok(report)
    }
}

async fn verify_size(path: &Path, expected: Option<u64>) -> Result<(), EngineError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = tokio::fs::metadata(path)
        .await
        .map_err(|e| EngineError::io(path, e))?
        .len();
    if actual != expected {
        return Err(EngineError::Integrity {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Downloads `url` to `destination`, choosing the strategy automatically.
///
/// # Errors
///
/// Returns [`EngineError::InvalidOptions`] for a bad URL or option, and any
/// error of [`Downloader::download`].
pub async fn download(
    url: &str,
    destination: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<DownloadReport, EngineError> {
    run_with_mode(url, destination.as_ref(), options, Mode::Auto).await
}

/// Downloads in blocks whenever the server supports ranges, whatever the size.
///
/// Falls back to a single stream when ranges are not supported.
///
/// # Errors
///
/// Same as [`download`].
pub async fn multi_block_download(
    url: &str,
    destination: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<DownloadReport, EngineError> {
    run_with_mode(url, destination.as_ref(), options, Mode::MultiBlock).await
}

/// Downloads with a single stream, never issuing block requests.
///
/// # Errors
///
/// Same as [`download`].
pub async fn single_stream_download(
    url: &str,
    destination: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<DownloadReport, EngineError> {
    run_with_mode(url, destination.as_ref(), options, Mode::SingleStream).await
}

async fn run_with_mode(
    url: &str,
    destination: &Path,
    options: &TransferOptions,
    mode: Mode,
) -> Result<DownloadReport, EngineError> {
    let descriptor = TransferDescriptor::new(url, destination, options)?;
    Downloader::default().download_with(&descriptor, mode).await
}
