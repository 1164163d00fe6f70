//! HTTP download engine.
//!
//! A transfer is described once by a [`TransferDescriptor`], probed for size
//! and byte-range support, and then executed by one of two engines:
//!
//! - **multi-block**: the resource is split into fixed-size blocks fetched by
//!   a bounded pool of workers with ranged GETs; each block is written at its
//!   own offset of a preallocated file and retried on its own;
//! - **single-stream**: one GET streamed sequentially; a failure restarts the
//!   whole transfer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use funget::download::{Downloader, HttpClient, ProgressSnapshot, TransferDescriptor, TransferOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = TransferDescriptor::new(
//!     "https://example.com/archive.tar",
//!     "./downloads/archive.tar",
//!     &TransferOptions::default(),
//! )?;
//! let downloader = Downloader::new(HttpClient::new()).with_observer(Arc::new(
//!     |s: ProgressSnapshot| println!("{} / {:?}", s.bytes_transferred, s.total_bytes),
//! ));
//! let report = downloader.download(&descriptor).await?;
//! println!("saved {}", report.path.display());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod descriptor;
mod engine;
mod error;
mod multi;
mod planner;
mod probe;
mod progress;
mod retry;
mod single;
mod target;

pub use client::{ContentRange, HttpClient, parse_content_range};
pub(crate) use descriptor::header_map;
pub use descriptor::{TransferDescriptor, TransferOptions};
pub use engine::{
    DownloadReport, DownloadStats, Downloader, FileInfo, Mode, Strategy, download,
    multi_block_download, select_strategy, single_stream_download,
};
pub use error::{BlockFailure, DownloadError, EngineError};
pub use planner::{Block, BlockState, plan_blocks};
pub use probe::{ResourceMeta, probe, validate_url};
pub use progress::{ProgressObserver, ProgressSnapshot, ProgressTracker};
pub use retry::{
    DEFAULT_BASE_DELAY, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after, retry_after_delay,
};
pub use target::{FileTarget, ensure_parent_dir};
