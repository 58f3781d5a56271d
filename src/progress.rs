//! Progress reporting and cooperative cancellation.
//!
//! A [`CancellationToken`] is polled by the stream adapter's interrupt
//! callback, so cancelling it makes the next blocking read inside FFmpeg fail
//! and the request return [`ThumbnailError::Cancelled`](crate::ThumbnailError::Cancelled).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediathumb::{CancellationToken, PipelineOptions, ProgressCallback, ProgressInfo};
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         println!("{:?}: {} item(s)", info.operation, info.current);
//!     }
//! }
//!
//! let token = CancellationToken::new();
//! let options = PipelineOptions::new()
//!     .with_progress(Arc::new(PrintProgress))
//!     .with_cancellation(token.clone());
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

/// Stage of the pipeline a progress report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationType {
    /// Decoding candidate frames.
    FrameSampling,
    /// Reading the remaining packets to measure duration.
    DurationScan,
    /// Resizing and encoding the thumbnail.
    ThumbnailRender,
}

/// A progress snapshot.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Stage being reported.
    pub operation: OperationType,
    /// Items (frames or packets) handled so far.
    pub current: u64,
    /// Upper bound on items, when known. For sampling this is the frame cap.
    pub total: Option<u64>,
    /// `current / total` as a percentage.
    pub percentage: Option<f32>,
    /// Time since the stage started.
    pub elapsed: Duration,
    /// Presentation time of the item just handled.
    pub current_timestamp: Option<Duration>,
}

/// Receives progress snapshots.
///
/// Callbacks run on the session thread and must not block for long. They
/// cannot stop the pipeline; use a [`CancellationToken`] for that.
pub trait ProgressCallback: Send + Sync {
    /// Called every `batch_size` items and once when a stage finishes.
    fn on_progress(&self, info: &ProgressInfo);
}

pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Shared cancellation flag. Clones observe the same state.
///
/// ```
/// use mediathumb::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Irreversible.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](CancellationToken::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Counts items for one stage and forwards batched snapshots.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    operation: OperationType,
    total: Option<u64>,
    current: u64,
    batch_size: u64,
    pending: u64,
    started: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(
        callback: Arc<dyn ProgressCallback>,
        operation: OperationType,
        total: Option<u64>,
        batch_size: u64,
    ) -> Self {
        Self {
            callback,
            operation,
            total,
            current: 0,
            batch_size: batch_size.max(1),
            pending: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn advance(&mut self, timestamp: Option<Duration>) {
        self.current += 1;
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.report(timestamp);
            self.pending = 0;
        }
    }

    pub(crate) fn finish(&mut self) {
        self.report(None);
    }

    pub(crate) fn current(&self) -> u64 {
        self.current
    }

    fn report(&self, timestamp: Option<Duration>) {
        let percentage = self
            .total
            .filter(|&total| total > 0)
            .map(|total| (self.current.min(total) as f32 / total as f32) * 100.0);

        self.callback.on_progress(&ProgressInfo {
            operation: self.operation,
            current: self.current,
            total: self.total,
            percentage,
            elapsed: self.started.elapsed(),
            current_timestamp: timestamp,
        });
    }
}
