//! Progress reporting side channel.
//!
//! Engines never store progress as state they depend on; they push
//! [`ProgressSnapshot`]s to an observer. Observers are advisory and run on
//! the worker that made progress, so they should return quickly.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes transferred so far for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Bytes confirmed written to the destination.
    pub bytes_transferred: u64,
    /// Total size, when known.
    pub total_bytes: Option<u64>,
}

impl ProgressSnapshot {
    /// True once every announced byte has been transferred.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_transferred >= total)
    }
}

/// Receives progress updates from an engine.
pub trait ProgressObserver: Send + Sync {
    /// Called after every progress change.
    fn on_progress(&self, snapshot: ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        self(snapshot);
    }
}

/// Shared progress counter for one transfer.
///
/// The counter is the only state block workers mutate together. It is updated
/// and reported under one lock, so observers see values in the order they were
/// reached and never a smaller value after a larger one. Observers must not
/// call back into the tracker.
///
/// A restarted single stream reports nothing new until it passes its previous
/// high-water mark.
#[derive(Clone)]
pub struct ProgressTracker {
    transferred: Arc<Mutex<u64>>,
    total: Option<u64>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("transferred", &self.transferred())
            .field("total", &self.total)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl ProgressTracker {
    /// Creates a tracker starting at zero.
    #[must_use]
    pub fn new(total: Option<u64>, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        Self {
            transferred: Arc::new(Mutex::new(0)),
            total,
            observer,
        }
    }

    /// Adds `delta` bytes and notifies the observer.
    pub fn add(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut transferred = self.lock();
        *transferred += delta;
        self.emit(*transferred);
    }

    /// Raises the counter to `position` if it is higher than the current value.
    pub fn advance_to(&self, position: u64) {
        let mut transferred = self.lock();
        if position > *transferred {
            *transferred = position;
            self.emit(position);
        }
    }

    /// Bytes reported so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        *self.lock()
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_transferred: self.transferred(),
            total_bytes: self.total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.transferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, bytes_transferred: u64) {
        if let Some(observer) = &self.observer {
            observer.on_progress(ProgressSnapshot {
                bytes_transferred,
                total_bytes: self.total,
            });
        }
    }
}
