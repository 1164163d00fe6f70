//! Multi-block engine: ranged GETs fanned out over a bounded worker pool.
//!
//! The block table is the only shared mutable state besides the progress
//! counter. Workers pull the next pending block, fetch it, and write it at its
//! own offset in the preallocated destination. A failed block goes back to
//! the tail of the queue so any free worker can pick it up; a block that
//! spends its retry budget (or hits a permanent error) is marked failed and
//! the remaining blocks still run to completion.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::read_chunk;
use super::descriptor::TransferDescriptor;
use super::error::{BlockFailure, DownloadError, EngineError};
use super::planner::{Block, BlockState, plan_blocks};
use super::progress::ProgressTracker;
use super::retry::{RetryDecision, RetryPolicy, classify_error, retry_after_delay};
use super::target::FileTarget;
use super::{DownloadStats, HttpClient};

/// Per-block bookkeeping guarded by one mutex.
#[derive(Debug)]
struct BlockTable {
    blocks: Vec<Block>,
    pending: VecDeque<usize>,
    last_errors: Vec<Option<String>>,
}

impl BlockTable {
    fn new(blocks: Vec<Block>) -> Self {
        let pending = (0..blocks.len()).collect();
        let last_errors = vec![None; blocks.len()];
        Self {
            blocks,
            pending,
            last_errors,
        }
    }

    /// Pops the next pending block and marks it fetching.
    fn take_next(&mut self) -> Option<Block> {
        let index = self.pending.pop_front()?;
        let block = &mut self.blocks[index];
        block.state = BlockState::Fetching;
        Some(block.clone())
    }

    fn mark_done(&mut self, index: usize) {
        self.blocks[index].state = BlockState::Done;
    }

    /// Counts a failed attempt and returns the new total.
    fn record_failure(&mut self, index: usize, error: &DownloadError) -> u32 {
        self.last_errors[index] = Some(error.to_string());
        let block = &mut self.blocks[index];
        block.attempts += 1;
        block.attempts
    }

    fn requeue(&mut self, index: usize) {
        self.blocks[index].state = BlockState::Pending;
        self.pending.push_back(index);
    }

    fn mark_failed(&mut self, index: usize) {
        self.blocks[index].state = BlockState::Failed;
    }

    fn failures(&self) -> Vec<BlockFailure> {
        self.blocks
            .iter()
            .filter(|block| block.state != BlockState::Done)
            .map(|block| BlockFailure {
                index: block.index,
                stream: false,
                start: block.start,
                end: Some(block.end),
                attempts: block.attempts,
                error: self.last_errors[block.index]
                    .clone()
                    .unwrap_or_else(|| "not attempted".to_string()),
            })
            .collect()
    }
}

/// Everything a worker task needs, cloned once per worker.
#[derive(Clone)]
struct WorkerContext {
    client: HttpClient,
    descriptor: Arc<TransferDescriptor>,
    target: FileTarget,
    progress: ProgressTracker,
    stats: Arc<DownloadStats>,
    table: Arc<Mutex<BlockTable>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn table(&self) -> std::sync::MutexGuard<'_, BlockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Downloads `total_size` bytes as independent ranged blocks.
///
/// Returns the number of blocks the transfer was split into.
///
/// # Errors
///
/// - [`EngineError::Planning`] if the size or block size is zero
/// - [`EngineError::Conflict`] / [`EngineError::Io`] if the destination cannot be opened
/// - [`EngineError::Cancelled`] if the token was cancelled; in-flight fetches
///   and backoff waits stop at once
/// - [`EngineError::Transfer`] listing every block that did not complete
#[instrument(skip_all, fields(url = %descriptor.url(), total_size = total_size))]
pub(crate) async fn run(
    client: &HttpClient,
    descriptor: Arc<TransferDescriptor>,
    total_size: u64,
    progress: &ProgressTracker,
    stats: Arc<DownloadStats>,
    cancel: CancellationToken,
) -> Result<usize, EngineError> {
    let blocks = plan_blocks(total_size, descriptor.block_size())?;
    let block_count = blocks.len();
    let workers = descriptor.effective_workers(block_count);
    let target =
        FileTarget::open(descriptor.destination(), total_size, descriptor.overwrite()).await?;

    info!(
        blocks = block_count,
        workers,
        block_size = descriptor.block_size(),
        "starting multi-block download"
    );

    let context = WorkerContext {
        client: client.clone(),
        policy: descriptor.retry_policy(),
        descriptor,
        target: target.clone(),
        progress: progress.clone(),
        stats,
        table: Arc::new(Mutex::new(BlockTable::new(blocks))),
        cancel,
    };

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let context = context.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker, &context).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "block worker panicked");
        }
    }

    if context.cancel.is_cancelled() {
        target.close_after_failure().await;
        return Err(EngineError::Cancelled);
    }

    let failures = context.table().failures();
    if !failures.is_empty() {
        warn!(
            failed = failures.len(),
            blocks = block_count,
            "multi-block download incomplete"
        );
        target.close_after_failure().await;
        return Err(EngineError::Transfer {
            url: context.descriptor.url().to_string(),
            failures,
        });
    }

    target.close().await?;
    info!(blocks = block_count, "multi-block download complete");
    Ok(block_count)
}

async fn worker_loop(worker: usize, context: &WorkerContext) {
    loop {
        if context.cancel.is_cancelled() {
            debug!(worker, "cancelled; worker stopping");
            return;
        }
        let next = context.table().take_next();
        let Some(block) = next else {
            debug!(worker, "no pending blocks; worker exiting");
            return;
        };

        debug!(worker, block = block.index, range = %block.range_header(), "fetching block");
        let outcome = tokio::select! {
            biased;
            () = context.cancel.cancelled() => Err(DownloadError::Cancelled),
            result = fetch_block(context, &block) => result,
        };
        let error = match outcome {
            Ok(()) => {
                context.table().mark_done(block.index);
                context.progress.add(block.len());
                context.stats.increment_completed();
                continue;
            }
            Err(e) => e,
        };

        if matches!(error, DownloadError::Cancelled) {
            context.table().requeue(block.index);
            return;
        }

        let attempts = context.table().record_failure(block.index, &error);
        match context.policy.should_retry(classify_error(&error), attempts) {
            RetryDecision::Retry { delay, attempt } => {
                let delay = retry_after_delay(&error).unwrap_or(delay);
                info!(
                    worker,
                    block = block.index,
                    attempt,
                    max_attempts = context.policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying block"
                );
                context.stats.increment_retried();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = context.cancel.cancelled() => {
                        debug!(worker, block = block.index, "cancelled during backoff");
                    }
                }
                context.table().requeue(block.index);
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(
                    worker,
                    block = block.index,
                    attempts,
                    %reason,
                    error = %error,
                    "block failed"
                );
                context.stats.increment_failed();
                context.table().mark_failed(block.index);
            }
        }
    }
}

/// Fetches one block and writes it at its offset.
///
/// A block that delivers fewer or more bytes than its span is a short read.
async fn fetch_block(context: &WorkerContext, block: &Block) -> Result<(), DownloadError> {
    let url = context.descriptor.url().as_str();
    let response = context
        .client
        .get_range(&context.descriptor, block.start, block.end)
        .await?;

    let expected = block.len();
    let mut written = 0u64;
    let idle = context.descriptor.timeout();
    let mut stream = std::pin::pin!(response.bytes_stream());

    while let Some(chunk) = read_chunk(&mut stream, url, idle).await? {
        let len = chunk.len() as u64;
        if written + len > expected {
            return Err(DownloadError::short_read(url, expected, written + len));
        }
        context.target.write_at(block.start + written, chunk).await?;
        written += len;
    }

    if written != expected {
        return Err(DownloadError::short_read(url, expected, written));
    }
    Ok(())
}
