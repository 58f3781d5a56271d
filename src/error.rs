//! Error types for the `mediathumb` crate.
//!
//! [`ThumbnailError`] is the single error type returned by every fallible
//! operation. Variants are grouped the way callers usually need to branch on
//! them: session-terminating decode failures, raster failures, invalid media,
//! and cancellation.

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use image::error::{LimitErrorKind, UnsupportedErrorKind};
use thiserror::Error;

/// The unified error type for all `mediathumb` operations.
///
/// A missing decoder and an oversized frame are not fatal for a thumbnail
/// request: both degrade to a duration-only result (see
/// [`FallbackReason`](crate::FallbackReason)). The matching variants here are
/// only produced by lower-level calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ThumbnailError {
    /// The input could not be opened.
    #[error("Failed to open media at {path}: {reason}")]
    FileOpen {
        /// Path that was passed to the constructor.
        path: PathBuf,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The container holds neither a video nor an audio stream.
    #[error("No video or audio stream found")]
    NoMediaStreams,

    /// The video stream ended before a single frame could be decoded.
    #[error("No decodable video frame found")]
    NoDecodableFrames,

    /// No decoder is available for the selected stream's codec.
    #[error("No decoder available for codec {0}")]
    DecoderNotFound(String),

    /// The video (or cover art) exceeds the configured dimension limit.
    #[error("Frame size {width}x{height} exceeds maximum allowed dimension {max}")]
    FrameTooLarge {
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
        /// Configured per-side maximum.
        max: u32,
    },

    /// The decode engine rejected the input as malformed.
    #[error("Invalid data found when processing input")]
    InvalidData,

    /// A native buffer allocation failed.
    #[error("Cannot allocate memory")]
    OutOfMemory,

    /// The operation was interrupted through a [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// Any other error reported by the FFmpeg libraries.
    #[error("FFmpeg error {code}: {message}")]
    Ffmpeg {
        /// Raw `AVERROR` code.
        code: i32,
        /// Human readable description from FFmpeg.
        message: String,
    },

    /// The raster engine does not recognise the source format.
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// The format is known but this particular variant cannot be rendered
    /// (for example animated WebP).
    #[error("Unsupported format feature: {0}")]
    UnsupportedFeature(String),

    /// Encoding the thumbnail failed.
    #[error("Failed to encode thumbnail: {0}")]
    Encode(String),

    /// The request parameters are out of range.
    #[error("Invalid thumbnail request: {0}")]
    InvalidRequest(String),

    /// An engine was used after `shutdown()`.
    #[error("The {0} engine has been shut down")]
    EngineShutdown(&'static str),

    /// A raster thread context was entered while another render on the same
    /// thread was still in flight.
    #[error("Raster thread context is already in use on this thread")]
    ContextBusy,

    /// An I/O error occurred while reading the source or writing the sink.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// An error from the `image` crate during decoding or encoding.
    #[error("Image processing error: {0}")]
    Image(ImageError),

    /// Invariant violation inside the pipeline (a worker thread panicked, a
    /// buffer had the wrong size).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThumbnailError {
    /// `true` when the input was recognised as media but its data is corrupt.
    ///
    /// Lets callers tell "this is not valid media" apart from "this media
    /// type is not supported".
    pub fn is_invalid_data(&self) -> bool {
        matches!(self, ThumbnailError::InvalidData)
    }

    /// `true` for errors caused by an unsupported format, codec, or feature.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            ThumbnailError::UnsupportedFormat(_)
                | ThumbnailError::UnsupportedFeature(_)
                | ThumbnailError::DecoderNotFound(_)
        )
    }

    /// `true` if the operation was interrupted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ThumbnailError::Cancelled)
    }
}

impl From<FfmpegError> for ThumbnailError {
    fn from(error: FfmpegError) -> Self {
        match error {
            FfmpegError::InvalidData => ThumbnailError::InvalidData,
            FfmpegError::Exit => ThumbnailError::Cancelled,
            FfmpegError::DecoderNotFound => ThumbnailError::DecoderNotFound("unknown".to_string()),
            FfmpegError::Other { errno } if errno == ffmpeg_next::error::ENOMEM => {
                ThumbnailError::OutOfMemory
            }
            other => ThumbnailError::Ffmpeg {
                code: i32::from(other),
                message: other.to_string(),
            },
        }
    }
}

impl From<ImageError> for ThumbnailError {
    fn from(error: ImageError) -> Self {
        match error {
            ImageError::Unsupported(unsupported) => match unsupported.kind() {
                UnsupportedErrorKind::Format(hint) => {
                    ThumbnailError::UnsupportedFormat(hint.to_string())
                }
                _ => ThumbnailError::UnsupportedFeature(unsupported.to_string()),
            },
            ImageError::Limits(limits) => match limits.kind() {
                LimitErrorKind::InsufficientMemory => ThumbnailError::OutOfMemory,
                _ => ThumbnailError::UnsupportedFeature(limits.to_string()),
            },
            ImageError::IoError(io) => ThumbnailError::Io(io),
            other => ThumbnailError::Image(other),
        }
    }
}
