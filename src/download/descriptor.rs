//! Transfer descriptor: the immutable description of one download.
//!
//! Callers fill in [`TransferOptions`] (every field has a documented default)
//! and turn it into a validated [`TransferDescriptor`] together with the URL
//! and destination. Engines only ever borrow the descriptor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_MIN_MULTI_SIZE, DEFAULT_TIMEOUT, DEFAULT_WORKER_LIMIT,
};
use super::error::EngineError;
use super::retry::{DEFAULT_BASE_DELAY, RetryPolicy};

/// Caller-facing download options.
///
/// # Default Values
///
/// | Field | Default |
/// |-------|---------|
/// | `headers` | empty |
/// | `timeout` | 30 s per request |
/// | `max_retries` | 3 attempts per block / stream |
/// | `overwrite` | `false` |
/// | `block_size` | 100 MiB |
/// | `worker_limit` | 10 |
/// | `capacity` | 100 in-flight blocks |
/// | `create_dirs` | `true` |
/// | `chunk_size` | 256 KiB |
/// | `min_multi_size` | 1 MiB |
/// | `retry_base_delay` | 1 s |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Extra request headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Timeout applied to each network request independently.
    pub timeout: Duration,
    /// Total attempts allowed per unit of work (values below 1 act as 1).
    pub max_retries: u32,
    /// Replace an existing destination file.
    pub overwrite: bool,
    /// Nominal block size in bytes for the multi-block engine.
    pub block_size: u64,
    /// Requested number of block workers.
    pub worker_limit: usize,
    /// Upper bound on in-flight blocks, applied on top of `worker_limit`.
    pub capacity: usize,
    /// Create missing parent directories of the destination.
    pub create_dirs: bool,
    /// Write buffer size for the single-stream engine.
    pub chunk_size: usize,
    /// Resources smaller than this are always fetched with a single stream.
    pub min_multi_size: u64,
    /// Base delay of the exponential retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            overwrite: false,
            block_size: DEFAULT_BLOCK_SIZE,
            worker_limit: DEFAULT_WORKER_LIMIT,
            capacity: DEFAULT_CAPACITY,
            create_dirs: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_multi_size: DEFAULT_MIN_MULTI_SIZE,
            retry_base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl TransferOptions {
    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Validated, immutable record of a single transfer request.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    url: Url,
    destination: PathBuf,
    headers: HeaderMap,
    timeout: Duration,
    max_retries: u32,
    overwrite: bool,
    block_size: u64,
    worker_limit: usize,
    capacity: usize,
    create_dirs: bool,
    chunk_size: usize,
    min_multi_size: u64,
    retry_base_delay: Duration,
}

impl TransferDescriptor {
    /// Validates the inputs and builds a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidOptions`] if the URL is not an absolute
    /// `http`/`https` URL, a header cannot be encoded, or a size/count option
    /// is zero.
    pub fn new(
        url: &str,
        destination: impl Into<PathBuf>,
        options: &TransferOptions,
    ) -> Result<Self, EngineError> {
        let url = Url::parse(url)
            .map_err(|e| EngineError::InvalidOptions(format!("invalid URL {url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::InvalidOptions(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        let destination = destination.into();
        if destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidOptions(
                "destination path is empty".to_string(),
            ));
        }

        if options.block_size == 0 {
            return Err(EngineError::InvalidOptions(
                "block_size must be positive".to_string(),
            ));
        }
        if options.worker_limit == 0 || options.capacity == 0 {
            return Err(EngineError::InvalidOptions(
                "worker_limit and capacity must be at least 1".to_string(),
            ));
        }
        if options.chunk_size == 0 {
            return Err(EngineError::InvalidOptions(
                "chunk_size must be positive".to_string(),
            ));
        }
        if options.timeout.is_zero() {
            return Err(EngineError::InvalidOptions(
                "timeout must be positive".to_string(),
            ));
        }

        let headers = header_map(&options.headers, EngineError::InvalidOptions)?;

        Ok(Self {
            url,
            destination,
            headers,
            timeout: options.timeout,
            max_retries: options.max_retries.max(1),
            overwrite: options.overwrite,
            block_size: options.block_size,
            worker_limit: options.worker_limit,
            capacity: options.capacity,
            create_dirs: options.create_dirs,
            chunk_size: options.chunk_size,
            min_multi_size: options.min_multi_size,
            retry_base_delay: options.retry_base_delay,
        })
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Destination path on disk.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Caller-supplied headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Total attempts per unit of work (always at least 1).
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether an existing destination may be replaced.
    #[must_use]
    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Nominal block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Whether missing parent directories are created.
    #[must_use]
    pub fn create_dirs(&self) -> bool {
        self.create_dirs
    }

    /// Single-stream write buffer size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Minimum size worth parallelizing.
    #[must_use]
    pub fn min_multi_size(&self) -> u64 {
        self.min_multi_size
    }

    /// Number of workers to run for `block_count` blocks.
    ///
    /// Bounded by the requested limit, the in-flight capacity, and the number
    /// of blocks (idle workers are never spawned).
    #[must_use]
    pub fn effective_workers(&self, block_count: usize) -> usize {
        self.worker_limit
            .min(self.capacity)
            .min(block_count)
            .max(1)
    }

    /// Retry policy derived from the attempt budget and backoff delay.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_retries).base_delay(self.retry_base_delay)
    }

    /// File name component of the destination.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Builds a header map from caller-supplied pairs, trimming both sides.
///
/// `invalid` turns a description of the offending header into the caller's
/// error type.
pub(crate) fn header_map<E>(
    headers: &BTreeMap<String, String>,
    invalid: impl Fn(String) -> E,
) -> Result<HeaderMap, E> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| invalid(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| invalid(format!("invalid value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
