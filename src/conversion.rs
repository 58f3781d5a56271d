//! Frame conversion and timestamp helpers.
//!
//! [`FrameConverter`] turns the selected decoded frame into a tightly packed
//! RGB or RGBA buffer, the input format of the raster stage.

use std::time::Duration;

use ffmpeg_next::{
    Rational,
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};

use crate::error::ThumbnailError;

/// A packed, row-major pixel buffer with no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedFrame {
    /// Interleaved samples, `width * height * bands` bytes.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// 3 for RGB, 4 for RGBA.
    pub bands: u8,
    /// EXIF orientation to apply when displaying the buffer.
    pub orientation: u8,
}

impl PackedFrame {
    /// Check that `data` matches the declared geometry.
    pub fn validate(&self) -> Result<(), ThumbnailError> {
        if self.bands != 3 && self.bands != 4 {
            return Err(ThumbnailError::InvalidRequest(format!(
                "unsupported band count {}",
                self.bands
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ThumbnailError::InvalidRequest("empty frame".to_string()));
        }
        let expected = self.width as usize * self.height as usize * self.bands as usize;
        if self.data.len() != expected {
            return Err(ThumbnailError::InvalidRequest(format!(
                "buffer holds {} bytes, {}x{}x{} needs {expected}",
                self.data.len(),
                self.width,
                self.height,
                self.bands
            )));
        }
        Ok(())
    }
}

/// Converts decoded frames to [`PackedFrame`]s.
pub(crate) struct FrameConverter;

impl FrameConverter {
    /// Convert `frame` to RGB, or RGBA when `with_alpha` is set.
    pub(crate) fn convert(
        frame: &VideoFrame,
        with_alpha: bool,
        orientation: u8,
    ) -> Result<PackedFrame, ThumbnailError> {
        let (width, height) = (frame.width(), frame.height());
        let (target, bands) = if with_alpha {
            (Pixel::RGBA, 4u8)
        } else {
            (Pixel::RGB24, 3u8)
        };

        let mut scaler = ScalingContext::get(
            frame.format(),
            width,
            height,
            target,
            width,
            height,
            ScalingFlags::BILINEAR,
        )?;
        let mut packed = VideoFrame::empty();
        scaler.run(frame, &mut packed)?;

        let data = frame_to_buffer(&packed, width, height, bands as usize)?;
        Ok(PackedFrame {
            data,
            width,
            height,
            bands,
            orientation,
        })
    }
}

/// Copy plane 0 of `video_frame` into a buffer without row padding.
///
/// Allocation failure is reported as [`ThumbnailError::OutOfMemory`].
pub(crate) fn frame_to_buffer(
    video_frame: &VideoFrame,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Result<Vec<u8>, ThumbnailError> {
    let stride = video_frame.stride(0);
    let row_bytes = width as usize * bytes_per_pixel;
    let rows = height as usize;
    let data = video_frame.data(0);

    if stride < row_bytes || data.len() < stride * rows.saturating_sub(1) + row_bytes {
        return Err(ThumbnailError::Internal(format!(
            "frame plane too small for {width}x{height} at {bytes_per_pixel} bytes per pixel"
        )));
    }

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(row_bytes * rows)
        .map_err(|_| ThumbnailError::OutOfMemory)?;
    if stride == row_bytes {
        buffer.extend_from_slice(&data[..row_bytes * rows]);
    } else {
        for row in data.chunks(stride).take(rows) {
            buffer.extend_from_slice(&row[..row_bytes]);
        }
    }
    Ok(buffer)
}

/// Whether `format` carries an alpha component.
pub(crate) fn pixel_has_alpha(format: Pixel) -> bool {
    let format: ffmpeg_sys_next::AVPixelFormat = format.into();
    let descriptor = unsafe { ffmpeg_sys_next::av_pix_fmt_desc_get(format) };
    if descriptor.is_null() {
        return false;
    }
    let flags = unsafe { (*descriptor).flags };
    flags & ffmpeg_sys_next::AV_PIX_FMT_FLAG_ALPHA as u64 != 0
}

/// Decoded picture size of one `width`×`height` frame in `format`.
pub(crate) fn frame_bytes(format: Pixel, width: u32, height: u32) -> usize {
    let format: ffmpeg_sys_next::AVPixelFormat = format.into();
    let size = unsafe {
        ffmpeg_sys_next::av_image_get_buffer_size(format, width as i32, height as i32, 1)
    };
    usize::try_from(size)
        .ok()
        .filter(|&size| size > 0)
        .unwrap_or(width as usize * height as usize * 4)
}

/// Presentation time of `pts` in `time_base`. Negative times yield `None`.
pub(crate) fn pts_to_duration(pts: i64, time_base: Rational) -> Option<Duration> {
    if time_base.denominator() == 0 {
        return None;
    }
    let seconds = pts as f64 * f64::from(time_base.numerator()) / f64::from(time_base.denominator());
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// A stream's `start_time`, with an unset value read as zero.
pub(crate) fn stream_start(start_time: i64) -> i64 {
    if start_time == ffmpeg_sys_next::AV_NOPTS_VALUE {
        0
    } else {
        start_time
    }
}

/// Time of `pts` measured from the stream's first timestamp `start`.
///
/// Both sampled frames and the duration scan go through here so that their
/// values share one origin.
pub(crate) fn elapsed_since_start(pts: i64, start: i64, time_base: Rational) -> Option<Duration> {
    pts_to_duration(pts.saturating_sub(start), time_base)
}

/// Container duration in `AV_TIME_BASE` units (microseconds).
pub(crate) fn micros_to_duration(micros: i64) -> Option<Duration> {
    u64::try_from(micros)
        .ok()
        .filter(|&micros| micros > 0)
        .map(Duration::from_micros)
}
