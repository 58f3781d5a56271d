//! Pipeline entry point: [`MediaFile`].
//!
//! A `MediaFile` pairs a [`StreamSource`] with the caller's coarse
//! classification of it. Video and audio go through the decode pipeline:
//! probe, resolve streams, sample frames, pick one, render it, settle the
//! duration. Everything else is handed to the raster engine as an image
//! file.
//!
//! ```no_run
//! use mediathumb::{MediaFile, MediaKind, ThumbnailRequest};
//!
//! let mut media = MediaFile::from_path("clip.mp4", MediaKind::Video);
//! let result = media.thumbnail(ThumbnailRequest::to_path("clip.jpg", 256))?;
//! if result.created {
//!     println!("{}x{}", result.width, result.height);
//! }
//! println!("duration: {:?}", media.metadata().duration);
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```

use std::env;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::configuration::PipelineOptions;
use crate::conversion::PackedFrame;
use crate::error::ThumbnailError;
use crate::metadata::{MediaMetadata, normalize_orientation};
use crate::raster::{RasterEngine, ThreadContext};
use crate::sampler::DecodeSampler;
use crate::session::{DecoderOutcome, FallbackReason, ProbeSession};
use crate::source::{SeekableSource, StreamSource};
use crate::thumbnail::{ThumbnailRequest, ThumbnailResult};

const DRAIN_CHUNK: usize = 64 * 1024;

/// Coarse classification of a source, supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    /// Documents and anything else the raster engine may be able to load.
    Other,
}

impl MediaKind {
    /// Classify by the top-level type of a MIME string such as `video/mp4`.
    ///
    /// ```
    /// use mediathumb::MediaKind;
    ///
    /// assert_eq!(MediaKind::from_mime_type("video/webm"), MediaKind::Video);
    /// assert_eq!(MediaKind::from_mime_type("Audio/MPEG"), MediaKind::Audio);
    /// assert_eq!(MediaKind::from_mime_type("application/pdf"), MediaKind::Other);
    /// ```
    pub fn from_mime_type(mime: &str) -> Self {
        let top_level = mime.split('/').next().unwrap_or_default().trim();
        if top_level.eq_ignore_ascii_case("video") {
            MediaKind::Video
        } else if top_level.eq_ignore_ascii_case("audio") {
            MediaKind::Audio
        } else if top_level.eq_ignore_ascii_case("image") {
            MediaKind::Image
        } else {
            MediaKind::Other
        }
    }

    fn is_decoded(self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio)
    }
}

/// A finished request handed back from a worker: the media, whose metadata
/// is filled in, and the request's result.
#[derive(Debug)]
pub struct ThumbnailOutcome {
    pub media: MediaFile,
    pub result: Result<ThumbnailResult, ThumbnailError>,
}

/// One source and everything learned about it.
///
/// The source is consumed by the first thumbnail request; the metadata stays
/// readable afterwards, including when the request failed after the duration
/// was settled.
///
/// # Example
///
/// ```no_run
/// use mediathumb::{MediaFile, MediaKind, PipelineOptions, ThumbnailRequest};
///
/// let options = PipelineOptions::new().with_max_frames(30);
/// let mut media = MediaFile::from_path("clip.mkv", MediaKind::Video);
/// let result = media.thumbnail_with_options(ThumbnailRequest::to_path("clip.jpg", 320), &options)?;
///
/// // Metadata is available even when no thumbnail was written
/// if !result.created {
///     println!("no thumbnail ({:?})", result.fallback);
/// }
/// println!("{:?}", media.metadata().duration);
/// # Ok::<(), mediathumb::ThumbnailError>(())
/// ```
pub struct MediaFile {
    source: Option<StreamSource>,
    kind: MediaKind,
    metadata: MediaMetadata,
}

impl Debug for MediaFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MediaFile")
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl MediaFile {
    pub fn new(source: StreamSource, kind: MediaKind) -> Self {
        Self {
            source: Some(source),
            kind,
            metadata: MediaMetadata::default(),
        }
    }

    /// A file on disk.
    pub fn from_path<P: AsRef<Path>>(path: P, kind: MediaKind) -> Self {
        Self::new(StreamSource::from_path(path), kind)
    }

    /// A forward-only reader.
    pub fn from_reader<R: Read + Send + 'static>(reader: R, kind: MediaKind) -> Self {
        Self::new(StreamSource::from_reader(reader), kind)
    }

    /// A seekable reader. `allow_seek_to_end` permits end-relative seeks
    /// before the source knows its final size.
    pub fn from_read_seeker<S: SeekableSource + 'static>(
        source: S,
        allow_seek_to_end: bool,
        kind: MediaKind,
    ) -> Self {
        Self::new(StreamSource::from_read_seeker(source, allow_seek_to_end), kind)
    }

    /// The classification, updated to [`MediaKind::Audio`] when a video
    /// request finds no video stream.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    /// Run a request on a worker thread and release that thread's raster
    /// state afterwards.
    #[cfg(any(feature = "rayon", feature = "async"))]
    pub(crate) fn thumbnail_on_worker(
        mut self,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> ThumbnailOutcome {
        let result = self.thumbnail_with_options(request, options);
        if let Err(error) = RasterEngine::thread_shutdown() {
            warn!("raster thread teardown failed: {error}");
        }
        ThumbnailOutcome {
            media: self,
            result,
        }
    }

    /// Produce a thumbnail with default options.
    pub fn thumbnail(&mut self, request: ThumbnailRequest<'_>) -> Result<ThumbnailResult, ThumbnailError> {
        self.thumbnail_with_options(request, &PipelineOptions::default())
    }

    /// Produce a thumbnail.
    ///
    /// `Ok` with `created == false` means the media was understood but no
    /// picture could be made: audio without cover art, a missing decoder or
    /// an oversized frame. [`fallback`](ThumbnailResult::fallback) tells the
    /// last two apart. The metadata is populated in every `Ok` case.
    ///
    /// Images are rendered on the calling thread, which keeps its raster
    /// state until [`RasterEngine::thread_shutdown`].
    ///
    /// # Errors
    ///
    /// [`ThumbnailError::InvalidRequest`] when the request is malformed or
    /// the source was already used; otherwise whatever the failing stage
    /// reports. Cancellation surfaces as [`ThumbnailError::Cancelled`] and
    /// writes nothing to the sink.
    pub fn thumbnail_with_options(
        &mut self,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        request.validate()?;
        let source = self.source.take().ok_or_else(|| {
            ThumbnailError::InvalidRequest("the media source has already been consumed".to_string())
        })?;
        let description = source.describe();
        let started = Instant::now();

        let result = if self.kind.is_decoded() {
            self.decode_and_render(source, request, options)
        } else {
            self.render_image(source, request, options)
        }?;

        info!(
            "{description}: {:?} {}x{} duration={:?} thumbnail={} ({}x{}, alpha: {}) in {:?}",
            self.kind,
            self.metadata.width,
            self.metadata.height,
            self.metadata.duration,
            if result.created { "created" } else { "none" },
            result.width,
            result.height,
            result.has_alpha,
            started.elapsed()
        );
        Ok(result)
    }

    fn decode_and_render(
        &mut self,
        source: StreamSource,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        let metadata = &mut self.metadata;
        let mut session = ProbeSession::open(source, options, metadata)?;
        session.resolve_streams(metadata)?;

        if !session.has_video() {
            self.kind = MediaKind::Audio;
            session.finalize_duration(metadata, options)?;
            return Ok(ThumbnailResult::default());
        }

        let mut decoder = match session.create_decoder(options.limits()) {
            DecoderOutcome::Full(decoder) => decoder,
            DecoderOutcome::DurationOnly(reason) => {
                session.finalize_duration(metadata, options)?;
                return Ok(ThumbnailResult::duration_only(reason));
            }
            DecoderOutcome::Fatal(error) => return Err(error),
        };

        let single_frame = session.is_attached_picture();
        let orientation = metadata.orientation;
        let mut sampler = DecodeSampler::new();
        let sampled = {
            let mut frames = session.frames(&mut decoder)?;
            sampler.run(&mut frames, options, single_frame, orientation)
        };
        drop(decoder);
        debug!(
            "decoded {} frame(s), latest at {:?}",
            sampler.frames_decoded(),
            sampler.latest_timestamp()
        );
        if !session.has_declared_duration() {
            if let Some(latest) = sampler.latest_timestamp() {
                metadata.raise_duration(latest);
            }
        }

        match sampled {
            Ok(sampled) => {
                debug!(
                    "rendering frame {} of {}",
                    sampled.selected_index, sampled.frames_scored
                );
                let packed = sampled.packed;
                let (rendered, finalized) = thread::scope(|scope| {
                    let worker = scope.spawn(|| render_on_worker(&packed, request, options));
                    let finalized = session.finalize_duration(metadata, options);
                    let rendered = worker.join().unwrap_or_else(|_| {
                        Err(ThumbnailError::Internal("render worker panicked".to_string()))
                    });
                    (rendered, finalized)
                });
                let result = rendered?;
                finalized?;
                Ok(result)
            }
            Err(ThumbnailError::FrameTooLarge { width, height, max }) => {
                warn!("decoded frame is {width}x{height}, larger than {max}; skipping thumbnail");
                session.finalize_duration(metadata, options)?;
                Ok(ThumbnailResult::duration_only(FallbackReason::TooLarge))
            }
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) => {
                if let Err(scan) = session.finalize_duration(metadata, options) {
                    warn!("duration scan after failed sampling also failed: {scan}");
                }
                Err(error)
            }
        }
    }

    fn render_image(
        &mut self,
        source: StreamSource,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        if options.is_cancelled() {
            return Err(ThumbnailError::Cancelled);
        }
        let mut context = ThreadContext::enter()?;
        let (result, orientation) = match source {
            StreamSource::Path(path) => context.render_path(&path, request, options, true)?,
            StreamSource::Seekable { mut source, .. } => match source.wait_for_path() {
                Some(path) => context.render_path(&path, request, options, true)?,
                None => {
                    render_drained(&mut context, source, &env::temp_dir(), request, options)?
                }
            },
            StreamSource::Reader(reader) => {
                render_drained(&mut context, reader, &env::temp_dir(), request, options)?
            }
        };

        self.metadata.width = result.source_width;
        self.metadata.height = result.source_height;
        self.metadata.orientation = normalize_orientation(orientation);
        Ok(result)
    }
}

/// Render on a dedicated thread context and tear it down afterwards.
fn render_on_worker(
    frame: &PackedFrame,
    request: ThumbnailRequest<'_>,
    options: &PipelineOptions,
) -> Result<ThumbnailResult, ThumbnailError> {
    let result = ThreadContext::enter()
        .and_then(|mut context| context.render_buffer_with_options(frame, request, options));
    if let Err(error) = RasterEngine::thread_shutdown() {
        warn!("raster thread teardown failed: {error}");
    }
    result
}

/// Copy a stream into a temporary file under `directory` and render that.
/// The copy is removed whatever the outcome.
fn render_drained<R: Read>(
    context: &mut ThreadContext,
    mut reader: R,
    directory: &Path,
    request: ThumbnailRequest<'_>,
    options: &PipelineOptions,
) -> Result<(ThumbnailResult, u8), ThumbnailError> {
    let mut temp = tempfile::Builder::new()
        .prefix("mediathumb-")
        .tempfile_in(directory)?;
    let mut buffer = vec![0u8; DRAIN_CHUNK];
    let mut copied = 0u64;
    loop {
        if options.is_cancelled() {
            return Err(ThumbnailError::Cancelled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.into()),
        };
        temp.as_file_mut().write_all(&buffer[..read])?;
        copied += read as u64;
    }
    temp.as_file_mut().flush()?;
    debug!("drained {copied} bytes to {}", temp.path().display());

    let result = context.render_path(temp.path(), request, options, false);
    if let Err(error) = temp.close() {
        warn!("failed to remove temporary copy: {error}");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::progress::CancellationToken;
    use crate::test_media::{FRAME_WIDTH, RAW_BGR, UNKNOWN_CODEC, avi};

    fn png_bytes() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(48, 32, image::Rgb([30, 120, 200]));
        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, image::ImageFormat::Png)
            .expect("encode png");
        bytes.into_inner()
    }

    fn entries(directory: &Path) -> usize {
        fs::read_dir(directory).expect("read temp dir").count()
    }

    #[test]
    fn mime_types_classify_by_top_level() {
        assert_eq!(MediaKind::from_mime_type("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime_type(" image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime_type("text/plain"), MediaKind::Other);
        assert_eq!(MediaKind::from_mime_type(""), MediaKind::Other);
    }

    #[test]
    fn source_is_consumed_once() {
        let mut media = MediaFile::from_reader(Cursor::new(vec![0u8; 16]), MediaKind::Image);
        assert!(media.thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32)).is_err());
        let error = media
            .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32))
            .unwrap_err();
        assert!(matches!(error, ThumbnailError::InvalidRequest(_)));
    }

    #[test]
    fn invalid_request_keeps_the_source() {
        let mut media = MediaFile::from_path("/nonexistent.png", MediaKind::Image);
        let error = media
            .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 0))
            .unwrap_err();
        assert!(matches!(error, ThumbnailError::InvalidRequest(_)));
        assert!(matches!(
            media.thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32)),
            Err(ThumbnailError::FileOpen { .. })
        ));
    }

    #[test]
    fn undecodable_stream_is_unsupported() {
        let mut media = MediaFile::from_reader(Cursor::new(vec![0x17u8; 512]), MediaKind::Other);
        let error = media
            .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32))
            .unwrap_err();
        assert!(error.is_unsupported(), "{error:?}");
    }

    #[test]
    fn video_without_decoder_reports_duration_only() {
        let mut bytes = Vec::new();
        let mut media = MediaFile::from_read_seeker(
            Cursor::new(avi(UNKNOWN_CODEC, 50)),
            true,
            MediaKind::Video,
        );
        let result = media
            .thumbnail(ThumbnailRequest::to_writer(&mut bytes, 32))
            .expect("a missing decoder is not an error");

        assert!(!result.created);
        assert_eq!(result.fallback, Some(FallbackReason::DecoderUnavailable));
        assert!(bytes.is_empty());
        assert_eq!(media.kind(), MediaKind::Video);
        assert!(media.metadata().has_video);
        let duration = media.metadata().duration.expect("duration should be known");
        assert!(
            duration.abs_diff(Duration::from_secs(2)) <= Duration::from_millis(40),
            "{duration:?}"
        );
    }

    #[test]
    fn raw_video_yields_thumbnail() {
        let mut media =
            MediaFile::from_read_seeker(Cursor::new(avi(RAW_BGR, 25)), true, MediaKind::Video);
        let result = media
            .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32))
            .expect("thumbnail");
        assert!(result.created);
        assert_eq!((result.width, result.height), (32, 24));
        assert_eq!(media.metadata().width, FRAME_WIDTH);
    }

    #[test]
    fn drained_copies_are_removed() {
        let directory = tempfile::tempdir().expect("temp dir");
        let options = PipelineOptions::new();
        let mut context = ThreadContext::enter().expect("raster context");

        let (result, _) = render_drained(
            &mut context,
            Cursor::new(png_bytes()),
            directory.path(),
            ThumbnailRequest::to_writer(Vec::new(), 16),
            &options,
        )
        .expect("render");
        assert!(result.created);
        assert_eq!(entries(directory.path()), 0);

        let failed = render_drained(
            &mut context,
            Cursor::new(vec![0x42u8; 2048]),
            directory.path(),
            ThumbnailRequest::to_writer(Vec::new(), 16),
            &options,
        );
        assert!(failed.is_err());
        assert_eq!(entries(directory.path()), 0);
    }

    #[test]
    fn cancelled_drain_leaves_no_copy() {
        let directory = tempfile::tempdir().expect("temp dir");
        let token = CancellationToken::new();
        token.cancel();
        let options = PipelineOptions::new().with_cancellation(token);
        let mut context = ThreadContext::enter().expect("raster context");

        let error = render_drained(
            &mut context,
            Cursor::new(png_bytes()),
            directory.path(),
            ThumbnailRequest::to_writer(Vec::new(), 16),
            &options,
        )
        .unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(entries(directory.path()), 0);
    }
}
