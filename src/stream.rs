//! Async thumbnails for tokio runtimes.
//!
//! The pipeline blocks on I/O and burns CPU while decoding, so
//! [`ThumbnailFuture`] runs it on tokio's blocking pool via
//! `spawn_blocking`. The blocking thread gets its own raster context and
//! releases it before the future resolves.
//!
//! # Example
//!
//! ```no_run
//! use mediathumb::{MediaFile, MediaKind, PipelineOptions, ThumbnailRequest};
//!
//! # async fn example() -> Result<(), mediathumb::ThumbnailError> {
//! let media = MediaFile::from_path("clip.mp4", MediaKind::Video);
//! let outcome = media
//!     .thumbnail_async(ThumbnailRequest::to_path("clip.jpg", 256), PipelineOptions::new())
//!     .await?;
//! println!("{:?} {:?}", outcome.result?, outcome.media.metadata().duration);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::configuration::PipelineOptions;
use crate::error::ThumbnailError;
use crate::media::{MediaFile, ThumbnailOutcome};
use crate::thumbnail::ThumbnailRequest;

/// A thumbnail request running on tokio's blocking pool.
///
/// Resolves to `Err` only when the blocking task itself was lost (panic or
/// runtime shutdown); pipeline errors are in [`ThumbnailOutcome::result`].
pub struct ThumbnailFuture {
    handle: JoinHandle<ThumbnailOutcome>,
}

impl Future for ThumbnailFuture {
    type Output = Result<ThumbnailOutcome, ThumbnailError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.map_err(|error| ThumbnailError::Internal(format!("thumbnail task failed: {error}")))
        })
    }
}

impl MediaFile {
    /// Run [`thumbnail_with_options`](MediaFile::thumbnail_with_options) on
    /// a blocking thread. Must be called from within a tokio runtime.
    pub fn thumbnail_async(
        self,
        request: ThumbnailRequest<'static>,
        options: PipelineOptions,
    ) -> ThumbnailFuture {
        let handle = tokio::task::spawn_blocking(move || self.thumbnail_on_worker(request, &options));
        ThumbnailFuture { handle }
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::media::MediaKind;

    #[tokio::test(flavor = "multi_thread")]
    async fn renders_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("logo.png");
        let mut image = RgbaImage::from_pixel(120, 60, Rgba([0, 0, 0, 0]));
        image.put_pixel(10, 10, Rgba([255, 0, 0, 255]));
        image.save(&input).unwrap();

        let output = dir.path().join("logo.thumb.png");
        let outcome = MediaFile::from_path(&input, MediaKind::Image)
            .thumbnail_async(ThumbnailRequest::to_path(&output, 60), PipelineOptions::new())
            .await
            .unwrap();
        let result = outcome.result.unwrap();
        assert!(result.created && result.has_alpha);
        assert_eq!((result.width, result.height), (60, 30));
        assert_eq!(outcome.media.metadata().width, 120);
        assert!(output.exists());
    }
}
