//! funget library
//!
//! Fetches a file from an HTTP endpoint, choosing between a single streamed
//! transfer and a concurrent, range-partitioned transfer depending on what
//! the server supports and how large the file is. Also ships a chunked
//! uploader and the configuration layer used by the `funget` binary.
//!
//! # Architecture
//!
//! - [`download`] - probing, block planning, the two download engines
//! - [`upload`] - streamed PUT/POST uploads with whole-transfer retry
//! - [`config`] - JSON / environment configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod upload;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, DownloadConfig, FungetConfig, UploadConfig};
pub use download::{
    DownloadError, DownloadReport, Downloader, EngineError, HttpClient, ProgressObserver,
    ProgressSnapshot, Strategy, TransferDescriptor, TransferOptions, download,
    multi_block_download, single_stream_download,
};
pub use upload::{UploadError, UploadMethod, UploadOptions, UploadReport, upload};
