//! Defaults for the download module (workers, block sizes, timeouts).

use std::time::Duration;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default number of block workers.
pub const DEFAULT_WORKER_LIMIT: usize = 10;

/// Hard cap on concurrently fetching blocks, regardless of requested workers.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default block size for the multi-block engine (100 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 100 * MIB;

/// Default total attempts per unit of work (block or whole stream).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default write buffer for the single-stream engine (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Resources smaller than this are fetched with a single stream (1 MiB).
pub const DEFAULT_MIN_MULTI_SIZE: u64 = MIB;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
