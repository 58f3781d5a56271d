//! Per-request operational settings.
//!
//! [`PipelineOptions`] carries the progress callback, the cancellation token
//! and the [`SamplingLimits`] through a request without widening every
//! signature. A default-constructed value is never cancelled, reports nothing
//! and uses the default limits.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::progress::{CancellationToken, NoOpProgress, ProgressCallback};

/// Maximum candidate frames decoded per request.
pub const DEFAULT_MAX_FRAMES: usize = 100;
/// Memory allowed for buffered candidate frames, in bytes.
pub const DEFAULT_FRAME_MEMORY_BUDGET: usize = 128 * 1024 * 1024;
/// Largest accepted width or height of a decoded frame.
pub const DEFAULT_MAX_DIMENSION: u32 = 16_384;

/// Bounds on the sampling stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingLimits {
    /// Hard cap on candidate frames.
    pub max_frames: usize,
    /// Total bytes the buffered candidates may occupy. The frame cap is
    /// lowered so that `frames * frame_bytes` stays under this.
    pub frame_memory_budget: usize,
    /// Frames (or cover art) larger than this on either side are not
    /// decoded; the request falls back to duration only.
    pub max_dimension: u32,
}

impl Default for SamplingLimits {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            frame_memory_budget: DEFAULT_FRAME_MEMORY_BUDGET,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

impl SamplingLimits {
    /// Frame cap for frames of `frame_bytes` each. Always at least one.
    ///
    /// ```
    /// use mediathumb::SamplingLimits;
    ///
    /// let limits = SamplingLimits::default();
    /// // 4K RGBA frames: 128 MiB / 33 MiB.
    /// assert_eq!(limits.max_frames_for(3840 * 2160 * 4), 4);
    /// assert_eq!(limits.max_frames_for(320 * 240 * 3), 100);
    /// ```
    pub fn max_frames_for(&self, frame_bytes: usize) -> usize {
        let by_budget = match frame_bytes {
            0 => self.max_frames,
            bytes => self.frame_memory_budget / bytes,
        };
        self.max_frames.min(by_budget.max(1)).max(1)
    }

    /// Whether a `width`×`height` frame is within [`max_dimension`](Self::max_dimension).
    pub fn allows(&self, width: u32, height: u32) -> bool {
        width <= self.max_dimension && height <= self.max_dimension
    }
}

/// Options threaded through a thumbnail or probe request.
#[derive(Clone)]
pub struct PipelineOptions {
    pub(crate) progress: Arc<dyn ProgressCallback>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) batch_size: u64,
    pub(crate) limits: SamplingLimits,
}

impl Debug for PipelineOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("PipelineOptions")
            .field("has_cancellation", &self.cancellation.is_some())
            .field("batch_size", &self.batch_size)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineOptions {
    /// No progress callback, no cancellation, batch size 1, default limits.
    pub fn new() -> Self {
        Self {
            progress: Arc::new(NoOpProgress),
            cancellation: None,
            batch_size: 1,
            limits: SamplingLimits::default(),
        }
    }

    /// Report progress to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Make the request interruptible through `token`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Report every `size` items. Clamped to at least 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Replace the sampling limits.
    #[must_use]
    pub fn with_limits(mut self, limits: SamplingLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Override the candidate frame cap. Clamped to at least 1.
    #[must_use]
    pub fn with_max_frames(mut self, frames: usize) -> Self {
        self.limits.max_frames = frames.max(1);
        self
    }

    /// Override the maximum accepted frame dimension.
    #[must_use]
    pub fn with_max_dimension(mut self, dimension: u32) -> Self {
        self.limits.max_dimension = dimension;
        self
    }

    /// The current sampling limits.
    pub fn limits(&self) -> &SamplingLimits {
        &self.limits
    }

    pub(crate) fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
