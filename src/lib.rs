//! # mediathumb
//!
//! Memory-bounded thumbnails and accurate duration metadata for video, audio
//! and still images.
//!
//! Video and audio are decoded with FFmpeg via the
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate: a bounded
//! number of frames is sampled, a representative one is picked by histogram,
//! and the duration is settled by scanning the container when it does not
//! declare one. Still images go through the [`image`] crate. Either way the
//! raster engine resizes into a bounding box, applies the orientation, and
//! encodes JPEG (opaque) or PNG (transparent).
//!
//! ## Quick Start
//!
//! ### Thumbnail a Video
//!
//! ```no_run
//! use mediathumb::{MediaFile, MediaKind, ThumbnailRequest};
//!
//! let mut media = MediaFile::from_path("input.mp4", MediaKind::Video);
//! let result = media.thumbnail(ThumbnailRequest::to_path("thumb.jpg", 256))?;
//! println!("created: {}, duration: {:?}", result.created, media.metadata().duration);
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```
//!
//! ### Thumbnail a Stream Into Memory
//!
//! ```no_run
//! use std::fs::File;
//!
//! use mediathumb::{MediaFile, MediaKind, ThumbnailRequest};
//!
//! let mut bytes = Vec::new();
//! let mut media = MediaFile::from_reader(File::open("photo.png")?, MediaKind::Image);
//! media.thumbnail(ThumbnailRequest::to_writer(&mut bytes, 128))?;
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```
//!
//! ### Probe Without Decoding
//!
//! ```no_run
//! use mediathumb::MediaProbe;
//!
//! let metadata = MediaProbe::probe_path("song.mp3")?;
//! println!("{:?} by {:?}", metadata.title, metadata.artist);
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```
//!
//! ## Features
//!
//! - **Bounded sampling**: at most `max_frames` decoded frames are alive at
//!   once, capped further by a per-request memory budget
//! - **Overlapped scoring**: frames are scored on a worker while decoding
//!   continues
//! - **Duration finalization**: declared durations are kept, missing ones
//!   are scanned
//! - **Any source**: paths, forward-only readers, seekable readers and
//!   files that are still being written ([`GrowingFile`])
//! - **Graceful fallbacks**: a missing decoder or an oversized frame yields
//!   metadata without a thumbnail instead of an error
//! - **Progress & cancellation**: [`ProgressCallback`] and
//!   [`CancellationToken`]
//! - **Bounded raster cache** with [`RasterEngine::memory_profile`]
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `async` | `MediaFile::thumbnail_async` on tokio's blocking pool |
//! | `rayon` | `thumbnail_batch` across rayon workers |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system.

mod adapter;
mod cache;
pub mod configuration;
mod conversion;
mod engine;
pub mod error;
pub mod ffmpeg;
mod histogram;
pub mod media;
pub mod metadata;
#[cfg(feature = "rayon")]
pub mod parallel;
pub mod probe;
pub mod progress;
pub mod raster;
mod sampler;
mod session;
pub mod source;
#[cfg(feature = "async")]
pub mod stream;
pub mod thumbnail;
#[cfg(test)]
mod test_media;

pub use cache::{
    CacheLimits, DEFAULT_CACHE_MAX_FILES, DEFAULT_CACHE_MAX_MEMORY, DEFAULT_CACHE_MAX_OPERATIONS,
    MemoryProfile,
};
pub use configuration::{
    DEFAULT_FRAME_MEMORY_BUDGET, DEFAULT_MAX_DIMENSION, DEFAULT_MAX_FRAMES, PipelineOptions,
    SamplingLimits,
};
pub use conversion::PackedFrame;
pub use error::ThumbnailError;
pub use ffmpeg::{
    FfmpegLogLevel, get_ffmpeg_log_level, init_decode_engine, set_ffmpeg_log_level,
    shutdown_decode_engine,
};
pub use media::{MediaFile, MediaKind, ThumbnailOutcome};
pub use metadata::{
    MediaMetadata, ORIENTATION_NORMAL, display_dimensions, normalize_orientation,
    orientation_from_clockwise_degrees, swaps_dimensions,
};
#[cfg(feature = "rayon")]
pub use parallel::thumbnail_batch;
pub use probe::MediaProbe;
pub use progress::{CancellationToken, OperationType, ProgressCallback, ProgressInfo};
pub use raster::{RasterEngine, ThreadContext};
pub use session::FallbackReason;
pub use source::{GrowingFile, GrowingFileReader, SeekableSource, StreamSource};
#[cfg(feature = "async")]
pub use stream::ThumbnailFuture;
pub use thumbnail::{
    AlphaPolicy, DEFAULT_QUALITY, ThumbnailRequest, ThumbnailResult, ThumbnailSink, fit_dimensions,
};
