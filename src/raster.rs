//! Raster engine: bounding-box thumbnails from packed buffers and image files.
//!
//! The engine has process-wide state (the operation cache, see
//! [`RasterEngine`]) and per-thread state (a resizer and the last error seen
//! on the thread). A render runs inside a [`ThreadContext`]; only one context
//! may be live per thread, and a thread that is done rendering calls
//! [`RasterEngine::thread_shutdown`] to release its state.
//!
//! Output with transparency is written as PNG, using an indexed palette when
//! the thumbnail has at most 256 distinct colours. Opaque output is JPEG at
//! the requested quality.
//!
//! ```no_run
//! use mediathumb::{PackedFrame, RasterEngine, ThreadContext, ThumbnailRequest};
//!
//! let frame = PackedFrame {
//!     data: vec![128; 640 * 480 * 3],
//!     width: 640,
//!     height: 480,
//!     bands: 3,
//!     orientation: 1,
//! };
//! let mut context = ThreadContext::enter()?;
//! let result = context.render_buffer(&frame, ThumbnailRequest::to_path("thumb.jpg", 128))?;
//! assert!(result.created);
//! drop(context);
//! RasterEngine::thread_shutdown()?;
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use fast_image_resize::{
    self as fr,
    images::{Image as FrImage, ImageRef},
};
use image::{
    DynamicImage, ExtendedColorType, ImageDecoder, ImageFormat, ImageReader, Limits, RgbImage,
    RgbaImage,
    codecs::{jpeg::JpegEncoder, webp::WebPDecoder},
    metadata::Orientation,
};
use log::debug;

use crate::cache::{self, CacheLimits, CachedImage, MemoryProfile, OperationKey, SourceKey};
use crate::configuration::PipelineOptions;
use crate::conversion::PackedFrame;
use crate::engine::EngineLifecycle;
use crate::error::ThumbnailError;
use crate::metadata::{
    ORIENTATION_NORMAL, display_dimensions, normalize_orientation, swaps_dimensions,
};
use crate::progress::{OperationType, ProgressTracker};
use crate::thumbnail::{AlphaPolicy, ThumbnailRequest, ThumbnailResult, ThumbnailSink, fit_dimensions};

static RASTER_ENGINE: EngineLifecycle = EngineLifecycle::new("raster");

// Resize, encode, write.
const RENDER_STEPS: u64 = 3;

const PALETTE_LIMIT: usize = 256;

struct ThreadState {
    resizer: Option<fr::Resizer>,
    in_use: bool,
    last_error: Option<String>,
}

thread_local! {
    static THREAD_STATE: RefCell<ThreadState> = const {
        RefCell::new(ThreadState {
            resizer: None,
            in_use: false,
            last_error: None,
        })
    };
}

/// Process-wide controls of the raster engine.
///
/// Cache limits are meant to be set once, before requests run. Changing them
/// between requests is safe; a request already in flight may observe either
/// the old or the new limits.
///
/// # Example
///
/// ```no_run
/// use mediathumb::{CacheLimits, RasterEngine, ThreadContext, ThumbnailRequest};
///
/// RasterEngine::init()?;
/// RasterEngine::set_cache_limits(CacheLimits {
///     max_operations: 50,
///     max_memory: 64 * 1024 * 1024,
///     max_files: 10,
/// });
///
/// let mut context = ThreadContext::enter()?;
/// let result = context.render_file("photo.png", ThumbnailRequest::to_path("photo_thumb.png", 128))?;
/// drop(context);
///
/// let profile = RasterEngine::memory_profile();
/// println!("{}x{}, cache holds {} bytes", result.width, result.height, profile.memory);
/// RasterEngine::thread_shutdown()?;
/// # Ok::<(), mediathumb::ThumbnailError>(())
/// ```
pub struct RasterEngine;

impl RasterEngine {
    /// Initialise the engine. Idempotent; fails after [`shutdown`](Self::shutdown).
    pub fn init() -> Result<(), ThumbnailError> {
        RASTER_ENGINE.ensure_ready(|| Ok(()))
    }

    /// Shut the engine down and drop the cache. The engine cannot be
    /// initialised again afterwards.
    pub fn shutdown() {
        RASTER_ENGINE.shutdown(|| cache::global().clear());
    }

    /// Replace all cache limits, evicting entries that no longer fit.
    pub fn set_cache_limits(limits: CacheLimits) {
        cache::global().set_limits(limits);
    }

    pub fn set_cache_max_operations(max_operations: usize) {
        Self::update_limits(|limits| limits.max_operations = max_operations);
    }

    pub fn set_cache_max_memory(max_memory: usize) {
        Self::update_limits(|limits| limits.max_memory = max_memory);
    }

    pub fn set_cache_max_files(max_files: usize) {
        Self::update_limits(|limits| limits.max_files = max_files);
    }

    fn update_limits<F: FnOnce(&mut CacheLimits)>(update: F) {
        let mut cache = cache::global();
        let mut limits = cache.limits();
        update(&mut limits);
        cache.set_limits(limits);
    }

    pub fn cache_limits() -> CacheLimits {
        cache::global().limits()
    }

    /// Memory currently tracked by the cache.
    pub fn memory_profile() -> MemoryProfile {
        cache::global().profile()
    }

    /// Drop every cached operation. The high-water mark is kept.
    pub fn drop_all_cache() {
        cache::global().clear();
    }

    /// Message of the last raster error on the calling thread.
    pub fn last_error() -> Option<String> {
        THREAD_STATE.with_borrow(|state| state.last_error.clone())
    }

    /// Release the calling thread's raster state and clear its last error.
    ///
    /// Fails with [`ThumbnailError::ContextBusy`] while a [`ThreadContext`]
    /// is live on this thread.
    pub fn thread_shutdown() -> Result<(), ThumbnailError> {
        THREAD_STATE.with_borrow_mut(|state| {
            if state.in_use {
                return Err(ThumbnailError::ContextBusy);
            }
            state.resizer = None;
            state.last_error = None;
            Ok(())
        })
    }
}

fn record_error<T>(result: Result<T, ThumbnailError>) -> Result<T, ThumbnailError> {
    if let Err(error) = &result {
        let message = error.to_string();
        THREAD_STATE.with_borrow_mut(|state| state.last_error = Some(message));
    }
    result
}

fn check_cancelled(options: &PipelineOptions) -> Result<(), ThumbnailError> {
    if options.is_cancelled() {
        return Err(ThumbnailError::Cancelled);
    }
    Ok(())
}

/// Exclusive use of the raster engine on the current thread.
///
/// Not `Send`: the context borrows thread-local state and must be dropped on
/// the thread that entered it.
pub struct ThreadContext {
    resizer: Option<fr::Resizer>,
    _thread_bound: PhantomData<*const ()>,
}

impl ThreadContext {
    /// Enter the raster engine on this thread.
    pub fn enter() -> Result<Self, ThumbnailError> {
        RasterEngine::init()?;
        THREAD_STATE.with_borrow_mut(|state| {
            if state.in_use {
                return Err(ThumbnailError::ContextBusy);
            }
            state.in_use = true;
            Ok(Self {
                resizer: Some(state.resizer.take().unwrap_or_else(fr::Resizer::new)),
                _thread_bound: PhantomData,
            })
        })
    }

    /// Render a packed RGB(A) buffer.
    pub fn render_buffer(
        &mut self,
        frame: &PackedFrame,
        request: ThumbnailRequest<'_>,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        self.render_buffer_with_options(frame, request, &PipelineOptions::default())
    }

    /// Render a packed RGB(A) buffer with progress and cancellation.
    pub fn render_buffer_with_options(
        &mut self,
        frame: &PackedFrame,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        record_error(self.render_packed(frame, request, options))
    }

    /// Load, orient and render an image file, using the operation cache.
    pub fn render_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        request: ThumbnailRequest<'_>,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        self.render_file_with_options(path, request, &PipelineOptions::default())
    }

    /// [`render_file`](Self::render_file) with progress, cancellation and
    /// the dimension limit of `options`.
    pub fn render_file_with_options<P: AsRef<Path>>(
        &mut self,
        path: P,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        self.render_path(path.as_ref(), request, options, true)
            .map(|(result, _)| result)
    }

    /// Render an image file and also return its embedded orientation.
    /// Temporary copies pass `cacheable = false`.
    pub(crate) fn render_path(
        &mut self,
        path: &Path,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
        cacheable: bool,
    ) -> Result<(ThumbnailResult, u8), ThumbnailError> {
        record_error(self.render_path_inner(path, request, options, cacheable))
    }

    fn render_packed(
        &mut self,
        frame: &PackedFrame,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
    ) -> Result<ThumbnailResult, ThumbnailError> {
        request.validate()?;
        frame.validate()?;
        check_cancelled(options)?;

        let mut tracker = render_tracker(options);
        let orientation = normalize_orientation(frame.orientation);
        let (source_width, source_height) =
            display_dimensions(frame.width, frame.height, orientation);
        let upright = self.fit_upright(frame, request.size)?;
        tracker.advance(None);
        debug!(
            "rendered {}x{} buffer to {}x{}",
            frame.width, frame.height, upright.width, upright.height
        );
        encode_and_write(
            &upright,
            (source_width, source_height),
            request,
            options,
            &mut tracker,
        )
    }

    fn render_path_inner(
        &mut self,
        path: &Path,
        request: ThumbnailRequest<'_>,
        options: &PipelineOptions,
        cacheable: bool,
    ) -> Result<(ThumbnailResult, u8), ThumbnailError> {
        request.validate()?;
        check_cancelled(options)?;

        let mut tracker = render_tracker(options);
        let source_key = if cacheable {
            SourceKey::for_path(path)
        } else {
            None
        };
        let thumbnail_key = source_key.clone().map(|source| OperationKey::Thumbnail {
            source,
            size: request.size,
        });
        let cached = thumbnail_key.as_ref().and_then(|key| cache::global().get(key));

        let thumbnail = match cached {
            Some(hit) => {
                debug!("thumbnail cache hit for {}", path.display());
                hit
            }
            None => {
                let loaded = load_upright(path, source_key, options.limits().max_dimension)?;
                let upright = self.fit_upright(&loaded.frame, request.size)?;
                let entry = CachedImage {
                    frame: Arc::new(upright),
                    ..loaded
                };
                if let Some(key) = thumbnail_key {
                    cache::global().insert(key, entry.clone());
                }
                entry
            }
        };
        tracker.advance(None);

        let result = encode_and_write(
            &thumbnail.frame,
            (thumbnail.source_width, thumbnail.source_height),
            request,
            options,
            &mut tracker,
        )?;
        Ok((result, thumbnail.orientation))
    }

    /// Resize to the bounding box and rotate upright.
    fn fit_upright(&mut self, frame: &PackedFrame, size: u32) -> Result<PackedFrame, ThumbnailError> {
        let orientation = normalize_orientation(frame.orientation);
        let (display_width, display_height) =
            display_dimensions(frame.width, frame.height, orientation);
        let (fit_width, fit_height) = fit_dimensions(display_width, display_height, size);
        let (width, height) = if swaps_dimensions(orientation) {
            (fit_height, fit_width)
        } else {
            (fit_width, fit_height)
        };

        let resized = PackedFrame {
            data: self.resize(frame, width, height)?,
            width,
            height,
            bands: frame.bands,
            orientation,
        };
        orient(resized)
    }

    fn resize(&mut self, frame: &PackedFrame, width: u32, height: u32) -> Result<Vec<u8>, ThumbnailError> {
        if (width, height) == (frame.width, frame.height) {
            return Ok(frame.data.clone());
        }
        let pixel_type = if frame.bands == 4 {
            fr::PixelType::U8x4
        } else {
            fr::PixelType::U8x3
        };
        let source = ImageRef::new(frame.width, frame.height, &frame.data, pixel_type)
            .map_err(|e| ThumbnailError::Internal(format!("invalid resize source: {e}")))?;
        let mut target = FrImage::new(width, height, pixel_type);
        self.resizer
            .get_or_insert_with(fr::Resizer::new)
            .resize(&source, &mut target, None)
            .map_err(|e| ThumbnailError::Internal(format!("resize failed: {e}")))?;
        Ok(target.into_vec())
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let resizer = self.resizer.take();
        let _ = THREAD_STATE.try_with(|cell| {
            let mut state = cell.borrow_mut();
            state.in_use = false;
            state.resizer = resizer;
        });
    }
}

fn render_tracker(options: &PipelineOptions) -> ProgressTracker {
    ProgressTracker::new(
        options.progress.clone(),
        OperationType::ThumbnailRender,
        Some(RENDER_STEPS),
        1,
    )
}

/// Decode an image file upright, through the `Load` cache when keyed.
fn load_upright(
    path: &Path,
    key: Option<SourceKey>,
    max_dimension: u32,
) -> Result<CachedImage, ThumbnailError> {
    let load_key = key.map(OperationKey::Load);
    if let Some(hit) = load_key.as_ref().and_then(|key| cache::global().get(key)) {
        debug!("load cache hit for {}", path.display());
        return Ok(hit);
    }

    let (image, orientation) = decode_image(path, max_dimension)?;
    let frame = packed_from_image(image);
    debug!(
        "decoded {} as {}x{} (orientation {orientation})",
        path.display(),
        frame.width,
        frame.height
    );
    let loaded = CachedImage {
        source_width: frame.width,
        source_height: frame.height,
        orientation,
        frame: Arc::new(frame),
    };
    if let Some(key) = load_key {
        cache::global().insert(key, loaded.clone());
    }
    Ok(loaded)
}

fn decode_image(path: &Path, max_dimension: u32) -> Result<(DynamicImage, u8), ThumbnailError> {
    let reader = ImageReader::open(path).map_err(|e| ThumbnailError::FileOpen {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = reader.with_guessed_format()?;
    let Some(format) = reader.format() else {
        return Err(ThumbnailError::UnsupportedFormat(
            path.display().to_string(),
        ));
    };
    if format == ImageFormat::WebP && is_animated_webp(path)? {
        return Err(ThumbnailError::UnsupportedFeature(
            "animated WebP".to_string(),
        ));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(max_dimension);
    limits.max_image_height = Some(max_dimension);
    reader.limits(limits);

    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok((image, orientation.to_exif()))
}

fn is_animated_webp(path: &Path) -> Result<bool, ThumbnailError> {
    let decoder = WebPDecoder::new(BufReader::new(File::open(path)?))?;
    Ok(decoder.has_animation())
}

fn packed_from_image(image: DynamicImage) -> PackedFrame {
    let (data, width, height, bands) = match image {
        DynamicImage::ImageRgb8(buffer) => {
            let (width, height) = buffer.dimensions();
            (buffer.into_raw(), width, height, 3)
        }
        DynamicImage::ImageRgba8(buffer) => {
            let (width, height) = buffer.dimensions();
            (buffer.into_raw(), width, height, 4)
        }
        other if other.color().has_alpha() => {
            let buffer = other.to_rgba8();
            let (width, height) = buffer.dimensions();
            (buffer.into_raw(), width, height, 4)
        }
        other => {
            let buffer = other.to_rgb8();
            let (width, height) = buffer.dimensions();
            (buffer.into_raw(), width, height, 3)
        }
    };
    PackedFrame {
        data,
        width,
        height,
        bands,
        orientation: ORIENTATION_NORMAL,
    }
}

fn orient(frame: PackedFrame) -> Result<PackedFrame, ThumbnailError> {
    if frame.orientation == ORIENTATION_NORMAL {
        return Ok(frame);
    }
    let Some(orientation) = Orientation::from_exif(frame.orientation) else {
        return Ok(frame);
    };
    let (width, height) = (frame.width, frame.height);
    let image = if frame.bands == 4 {
        RgbaImage::from_raw(width, height, frame.data).map(DynamicImage::ImageRgba8)
    } else {
        RgbImage::from_raw(width, height, frame.data).map(DynamicImage::ImageRgb8)
    };
    let Some(mut image) = image else {
        return Err(ThumbnailError::Internal(
            "buffer does not match its dimensions".to_string(),
        ));
    };
    image.apply_orientation(orientation);
    Ok(packed_from_image(image))
}

fn encode_and_write(
    frame: &PackedFrame,
    (source_width, source_height): (u32, u32),
    request: ThumbnailRequest<'_>,
    options: &PipelineOptions,
    tracker: &mut ProgressTracker,
) -> Result<ThumbnailResult, ThumbnailError> {
    let (pixels, bands) = prepare_alpha(frame, request.alpha);
    let encoded = if bands == 4 {
        encode_png(&pixels, frame.width, frame.height)?
    } else {
        encode_jpeg(&pixels, frame.width, frame.height, request.quality)?
    };
    tracker.advance(None);

    check_cancelled(options)?;
    write_sink(request.sink, &encoded)?;
    tracker.advance(None);

    Ok(ThumbnailResult {
        created: true,
        width: frame.width,
        height: frame.height,
        has_alpha: bands == 4,
        source_width,
        source_height,
        fallback: None,
    })
}

/// Pixels to encode plus their band count after alpha handling.
fn prepare_alpha(frame: &PackedFrame, policy: AlphaPolicy) -> (Cow<'_, [u8]>, u8) {
    if frame.bands != 4 {
        return (Cow::Borrowed(&frame.data), frame.bands);
    }
    if is_opaque(&frame.data) {
        return (Cow::Owned(flatten(&frame.data, [0, 0, 0])), 3);
    }
    match policy {
        AlphaPolicy::Preserve => (Cow::Borrowed(&frame.data), 4),
        AlphaPolicy::FlattenOnto(background) => (Cow::Owned(flatten(&frame.data, background)), 3),
    }
}

fn is_opaque(rgba: &[u8]) -> bool {
    rgba.chunks_exact(4).all(|pixel| pixel[3] == u8::MAX)
}

/// Composite RGBA over an opaque background.
fn flatten(rgba: &[u8], background: [u8; 3]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
    for pixel in rgba.chunks_exact(4) {
        let alpha = u32::from(pixel[3]);
        for (channel, &back) in pixel[..3].iter().zip(&background) {
            let blended = (u32::from(*channel) * alpha + u32::from(back) * (255 - alpha) + 127) / 255;
            rgb.push(blended as u8);
        }
    }
    rgb
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, ThumbnailError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| ThumbnailError::Encode(e.to_string()))?;
    Ok(out)
}

struct Palette {
    rgb: Vec<u8>,
    alpha: Vec<u8>,
    indices: Vec<u8>,
}

/// Index an RGBA buffer, or `None` past 256 colours. Fully transparent
/// pixels share one entry.
fn build_palette(rgba: &[u8]) -> Option<Palette> {
    let mut lookup: HashMap<[u8; 4], u8> = HashMap::new();
    let mut colors: Vec<[u8; 4]> = Vec::new();
    let mut indices = Vec::with_capacity(rgba.len() / 4);

    for pixel in rgba.chunks_exact(4) {
        let color = if pixel[3] == 0 {
            [0; 4]
        } else {
            [pixel[0], pixel[1], pixel[2], pixel[3]]
        };
        let index = match lookup.get(&color) {
            Some(&index) => index,
            None => {
                if colors.len() == PALETTE_LIMIT {
                    return None;
                }
                let index = colors.len() as u8;
                lookup.insert(color, index);
                colors.push(color);
                index
            }
        };
        indices.push(index);
    }

    Some(Palette {
        rgb: colors.iter().flat_map(|color| [color[0], color[1], color[2]]).collect(),
        alpha: colors.iter().map(|color| color[3]).collect(),
        indices,
    })
}

fn png_error(error: png::EncodingError) -> ThumbnailError {
    ThumbnailError::Encode(error.to_string())
}

fn encode_png(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ThumbnailError> {
    let mut out = Vec::new();
    let palette = build_palette(rgba);
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Best);
        let data: &[u8] = match &palette {
            Some(palette) => {
                encoder.set_color(png::ColorType::Indexed);
                encoder.set_palette(palette.rgb.as_slice());
                encoder.set_trns(palette.alpha.as_slice());
                &palette.indices
            }
            None => {
                encoder.set_color(png::ColorType::Rgba);
                rgba
            }
        };
        let mut writer = encoder.write_header().map_err(png_error)?;
        writer.write_image_data(data).map_err(png_error)?;
        writer.finish().map_err(png_error)?;
    }
    Ok(out)
}

fn write_sink(sink: ThumbnailSink<'_>, encoded: &[u8]) -> Result<(), ThumbnailError> {
    match sink {
        ThumbnailSink::Path(path) => fs::write(&path, encoded)?,
        ThumbnailSink::Writer(mut writer) => {
            writer.write_all(encoded)?;
            writer.flush()?;
        }
    }
    Ok(())
}
