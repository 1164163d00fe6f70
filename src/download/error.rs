//! Error types for the download module.
//!
//! Two layers of errors exist:
//!
//! - [`DownloadError`] describes why a single attempt (one block fetch, one
//!   pass of the single stream, one probe request) failed. These are absorbed
//!   into the retry counter and never returned from the public entry points
//!   on their own.
//! - [`EngineError`] is the public taxonomy returned to callers. Fatal stages
//!   (resolution, planning, conflict) propagate immediately; exhausted retry
//!   budgets surface as [`EngineError::Transfer`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during a single transfer attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// A ranged request was answered without a matching partial-content response.
    #[error("server did not honour range {start}-{end} for {url}: {detail}")]
    RangeNotHonoured {
        /// The URL that was requested.
        url: String,
        /// First requested byte.
        start: u64,
        /// Last requested byte (inclusive).
        end: u64,
        /// What the server sent instead.
        detail: String,
    },

    /// The response body ended before (or ran past) the expected byte count.
    #[error("short read from {url}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// The URL being read.
        url: String,
        /// Expected number of bytes.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The caller requested cancellation.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Maps a reqwest error, promoting timeouts to [`DownloadError::Timeout`].
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a range-not-honoured error.
    pub fn range_not_honoured(
        url: impl Into<String>,
        start: u64,
        end: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self::RangeNotHonoured {
            url: url.into(),
            start,
            end,
            detail: detail.into(),
        }
    }

    /// Creates a short-read error.
    pub fn short_read(url: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ShortRead {
            url: url.into(),
            expected,
            actual,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A byte range that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    /// Block index in write order (0 for the single stream).
    pub index: usize,
    /// True when the range was the whole single stream rather than a block.
    pub stream: bool,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive). `None` when the size was unknown.
    pub end: Option<u64>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Display text of the last attempt's error.
    pub error: String,
}

impl fmt::Display for BlockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream {
            f.write_str("stream")?;
        } else {
            write!(f, "block {}", self.index)?;
        }
        match self.end {
            Some(end) => write!(f, " [{}-{}]", self.start, end)?,
            None => write!(f, " [{}-]", self.start)?,
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.error)
    }
}

/// Errors returned by the download entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Size or capability detection failed; no partition is possible.
    #[error("could not resolve {url}: {reason}")]
    Resolution {
        /// The URL being probed.
        url: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The planner was given an invalid size.
    #[error("cannot plan blocks for total size {total_size} with block size {block_size}")]
    Planning {
        /// Requested total size.
        total_size: u64,
        /// Requested block size.
        block_size: u64,
    },

    /// The destination exists and overwriting is disabled.
    #[error("destination {} already exists and overwrite is disabled", path.display())]
    Conflict {
        /// The existing destination path.
        path: PathBuf,
    },

    /// One or more byte ranges exhausted their retries.
    #[error("transfer of {url} failed: {}", format_failures(failures))]
    Transfer {
        /// The URL being transferred.
        url: String,
        /// Every range that reached the failed state.
        failures: Vec<BlockFailure>,
    },

    /// The file on disk does not have the size the server announced.
    #[error(
        "integrity check failed for {}: expected {expected} bytes, got {actual}",
        path.display()
    )]
    Integrity {
        /// Destination path.
        path: PathBuf,
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// The caller cancelled the transfer.
    #[error("transfer cancelled")]
    Cancelled,

    /// Local file system error outside of a retried attempt.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The supplied options cannot describe a transfer.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl EngineError {
    /// Creates a resolution error.
    pub fn resolution(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Resolution {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the failed ranges of a [`EngineError::Transfer`], or an empty slice.
    #[must_use]
    pub fn failures(&self) -> &[BlockFailure] {
        match self {
            Self::Transfer { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn format_failures(failures: &[BlockFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
