//! Thumbnail requests, sinks and results.
//!
//! A [`ThumbnailRequest`] names a bounding box, an encode quality, where the
//! encoded bytes go, and what to do with transparency. It is read-only while
//! the pipeline runs. A [`ThumbnailResult`] is produced once per request;
//! its [`created`](ThumbnailResult::created) flag is the only reliable sign
//! that a thumbnail was written.
//!
//! ```no_run
//! use mediathumb::{AlphaPolicy, ThumbnailRequest};
//!
//! let mut bytes = Vec::new();
//! let request = ThumbnailRequest::to_writer(&mut bytes, 256)
//!     .with_quality(85)
//!     .with_alpha_policy(AlphaPolicy::FlattenOnto([255, 255, 255]));
//! # drop(request);
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ThumbnailError;
use crate::session::FallbackReason;

/// JPEG quality used when a request does not set one.
pub const DEFAULT_QUALITY: u8 = 75;

/// What to do with an alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaPolicy {
    /// Keep transparency and encode losslessly (PNG).
    #[default]
    Preserve,
    /// Composite onto an opaque background colour and encode as JPEG.
    FlattenOnto([u8; 3]),
}

/// Destination of the encoded thumbnail.
pub enum ThumbnailSink<'a> {
    /// Write a file, replacing any existing one.
    Path(PathBuf),
    /// Hand the encoded bytes to a writer.
    Writer(Box<dyn Write + Send + 'a>),
}

impl Debug for ThumbnailSink<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ThumbnailSink::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ThumbnailSink::Writer(_) => f.write_str("Writer"),
        }
    }
}

/// Parameters of one thumbnail.
#[derive(Debug)]
pub struct ThumbnailRequest<'a> {
    /// Longest side of the output, in pixels.
    pub size: u32,
    /// JPEG quality, 0 to 100. Ignored for lossless output.
    pub quality: u8,
    /// Where the encoded image goes.
    pub sink: ThumbnailSink<'a>,
    /// Transparency handling.
    pub alpha: AlphaPolicy,
}

impl<'a> ThumbnailRequest<'a> {
    /// Write the thumbnail to `path`.
    pub fn to_path<P: AsRef<Path>>(path: P, size: u32) -> Self {
        Self::new(ThumbnailSink::Path(path.as_ref().to_path_buf()), size)
    }

    /// Write the encoded thumbnail to `writer`.
    pub fn to_writer<W: Write + Send + 'a>(writer: W, size: u32) -> Self {
        Self::new(ThumbnailSink::Writer(Box::new(writer)), size)
    }

    fn new(sink: ThumbnailSink<'a>, size: u32) -> Self {
        Self {
            size,
            quality: DEFAULT_QUALITY,
            sink,
            alpha: AlphaPolicy::default(),
        }
    }

    /// Set the JPEG quality.
    #[must_use]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Set the transparency handling.
    #[must_use]
    pub fn with_alpha_policy(mut self, alpha: AlphaPolicy) -> Self {
        self.alpha = alpha;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ThumbnailError> {
        if self.size == 0 {
            return Err(ThumbnailError::InvalidRequest(
                "bounding box size must be positive".to_string(),
            ));
        }
        if self.quality > 100 {
            return Err(ThumbnailError::InvalidRequest(format!(
                "quality {} is outside 0..=100",
                self.quality
            )));
        }
        Ok(())
    }
}

/// Outcome of a thumbnail request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThumbnailResult {
    /// Whether a thumbnail was encoded and written.
    pub created: bool,
    /// Width of the written thumbnail.
    pub width: u32,
    /// Height of the written thumbnail.
    pub height: u32,
    /// Whether the written thumbnail carries transparency.
    pub has_alpha: bool,
    /// Width of the source after orientation correction.
    pub source_width: u32,
    /// Height of the source after orientation correction.
    pub source_height: u32,
    /// Why no thumbnail was produced for decodable media.
    pub fallback: Option<FallbackReason>,
}

impl ThumbnailResult {
    /// A result carrying metadata only.
    pub(crate) fn duration_only(reason: FallbackReason) -> Self {
        Self {
            fallback: Some(reason),
            ..Self::default()
        }
    }
}

/// Scale `width`×`height` down so the longest side is at most `size`.
///
/// Pictures already inside the box keep their size. The aspect ratio is
/// kept within rounding and neither side drops below one pixel.
///
/// ```
/// use mediathumb::fit_dimensions;
///
/// assert_eq!(fit_dimensions(1920, 1080, 256), (256, 144));
/// assert_eq!(fit_dimensions(100, 50, 256), (100, 50));
/// ```
pub fn fit_dimensions(width: u32, height: u32, size: u32) -> (u32, u32) {
    let long = width.max(height);
    if long == 0 || long <= size {
        return (width, height);
    }
    let scale = f64::from(size) / f64::from(long);
    let fit = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, size);
    (fit(width), fit(height))
}
