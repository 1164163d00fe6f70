//! Chunked file upload with whole-transfer retry.
//!
//! The file is streamed as the request body in `chunk_size` reads, so memory
//! use does not grow with the file. A request body cannot be rewound, so a
//! failed attempt reopens the file and sends it again from the start.
//!
//! The timeout is an idle limit: an attempt fails only when no body chunk has
//! been taken and no response has arrived for that long.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, RETRY_AFTER};
use reqwest::{Body, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::{
    DEFAULT_BASE_DELAY, DownloadError, HttpClient, ProgressObserver, ProgressTracker,
    RetryDecision, RetryPolicy, classify_error, header_map, retry_after_delay,
};

/// Default read size for the request body.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// Default attempts per upload.
pub const DEFAULT_UPLOAD_MAX_RETRIES: u32 = 3;

/// Default idle timeout for an upload attempt.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP method used to send the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    /// `PUT` the file at the URL.
    #[default]
    Put,
    /// `POST` the file to the URL.
    Post,
}

impl UploadMethod {
    fn as_method(self) -> Method {
        match self {
            Self::Put => Method::PUT,
            Self::Post => Method::POST,
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Put => f.write_str("PUT"),
            Self::Post => f.write_str("POST"),
        }
    }
}

impl FromStr for UploadMethod {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            other => Err(UploadError::InvalidOptions(format!(
                "unsupported upload method {other}: expected PUT or POST"
            ))),
        }
    }
}

/// Options for [`upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// HTTP method.
    pub method: UploadMethod,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Size of each body read.
    pub chunk_size: usize,
    /// Total attempts (values below 1 act as 1).
    pub max_retries: u32,
    /// How long an attempt may go without sending a chunk or receiving a response.
    pub timeout: Duration,
    /// Base delay of the retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            method: UploadMethod::default(),
            headers: BTreeMap::new(),
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_retries: DEFAULT_UPLOAD_MAX_RETRIES,
            timeout: DEFAULT_UPLOAD_TIMEOUT,
            retry_base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Errors returned by [`upload`].
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The source file does not exist.
    #[error("upload source {} does not exist", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The source file could not be read.
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        /// The file being uploaded.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The options cannot describe an upload.
    #[error("invalid upload options: {0}")]
    InvalidOptions(String),

    /// Every attempt failed, or a permanent error stopped the upload.
    #[error("upload to {url} failed after {attempts} attempt(s): {source}")]
    Failed {
        /// Target URL.
        url: String,
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: DownloadError,
    },
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Target URL.
    pub url: String,
    /// Uploaded file.
    pub path: PathBuf,
    /// Bytes sent.
    pub bytes: u64,
    /// HTTP status of the accepted response.
    pub status: u16,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Uploads `path` to `url` with a default client.
///
/// # Errors
///
/// See [`upload_with`].
pub async fn upload(
    url: &str,
    path: impl AsRef<Path>,
    options: &UploadOptions,
) -> Result<UploadReport, UploadError> {
    upload_with(&HttpClient::new(), url, path.as_ref(), options, None).await
}

/// Uploads `path` to `url`, retrying the whole transfer on transient errors.
///
/// # Errors
///
/// - [`UploadError::InvalidOptions`] for a bad URL, header, or zero chunk size
/// - [`UploadError::NotFound`] / [`UploadError::Io`] if the file cannot be read
/// - [`UploadError::Failed`] once retries are exhausted or on a permanent error
#[instrument(skip(client, options, observer), fields(path = %path.display(), method = %options.method))]
pub async fn upload_with(
    client: &HttpClient,
    url: &str,
    path: &Path,
    options: &UploadOptions,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<UploadReport, UploadError> {
    let url = parse_url(url)?;
    if options.chunk_size == 0 {
        return Err(UploadError::InvalidOptions(
            "chunk_size must be at least 1".to_string(),
        ));
    }
    let headers = header_map(&options.headers, UploadError::InvalidOptions)?;

    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(UploadError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(UploadError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let policy =
        RetryPolicy::with_max_attempts(options.max_retries).base_delay(options.retry_base_delay);
    let progress = ProgressTracker::new(Some(size), observer);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(attempt, size, "starting upload");

        let activity = Activity::new();
        let body = file_body(path, options.chunk_size, progress.clone(), activity.clone()).await?;
        let request = client
            .inner()
            .request(options.method.as_method(), url.clone())
            .headers(headers.clone())
            .header(CONTENT_LENGTH, size)
            .body(body);
        let result = send_watched(request, &activity, options.timeout, url.as_str()).await;

        let error = match result {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                info!(bytes = size, attempts = attempt, status, "upload complete");
                return Ok(UploadReport {
                    url: url.to_string(),
                    path: path.to_path_buf(),
                    bytes: size,
                    status,
                    attempts: attempt,
                });
            }
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                DownloadError::http_status_with_retry_after(
                    url.as_str(),
                    response.status().as_u16(),
                    retry_after,
                )
            }
            Err(e) => e,
        };

        match policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                let delay = retry_after_delay(&error).unwrap_or(delay);
                info!(
                    attempt = next,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying upload"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(attempts = attempt, %reason, error = %error, "upload failed");
                return Err(UploadError::Failed {
                    url: url.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }
        }
    }
}

/// Time of the last forward step of one upload attempt.
#[derive(Debug, Clone)]
struct Activity {
    started: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle: Duration) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle
    }
}

/// Sends `request`, failing once `activity` has been quiet for `idle`.
async fn send_watched(
    request: RequestBuilder,
    activity: &Activity,
    idle: Duration,
    url: &str,
) -> Result<Response, DownloadError> {
    let send = request.send();
    tokio::pin!(send);
    loop {
        let deadline = activity.idle_deadline(idle);
        tokio::select! {
            result = &mut send => {
                return result.map_err(|e| DownloadError::from_reqwest(url, e));
            }
            () = tokio::time::sleep_until(deadline) => {
                if activity.idle_deadline(idle) <= Instant::now() {
                    debug!(idle_ms = idle.as_millis(), "upload stalled");
                    return Err(DownloadError::timeout(url));
                }
            }
        }
    }
}

/// Opens `path` and wraps it as a streamed request body.
async fn file_body(
    path: &Path,
    chunk_size: usize,
    progress: ProgressTracker,
    activity: Activity,
) -> Result<Body, UploadError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UploadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    let stream = futures_util::stream::try_unfold(
        (file, 0u64, progress, activity),
        move |(mut file, sent, progress, activity)| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(None);
            }
            buf.truncate(n);
            let sent = sent + n as u64;
            activity.touch();
            progress.advance_to(sent);
            Ok(Some((buf, (file, sent, progress, activity))))
        },
    );
    Ok(Body::wrap_stream(stream))
}

fn parse_url(url: &str) -> Result<Url, UploadError> {
    let parsed = Url::parse(url)
        .map_err(|e| UploadError::InvalidOptions(format!("invalid URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UploadError::InvalidOptions(format!(
            "unsupported URL scheme {}: expected http or https",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}
