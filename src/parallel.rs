//! Batch thumbnails across rayon workers.
//!
//! Every request runs start to finish on one worker, in its own decode
//! session and its own raster thread context. Workers share nothing but the
//! process-wide raster cache; each tears its raster state down when its
//! request is done.

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::configuration::PipelineOptions;
use crate::error::ThumbnailError;
use crate::media::{MediaFile, ThumbnailOutcome};
use crate::thumbnail::ThumbnailRequest;

/// Render every job in parallel. Outcomes come back in job order.
///
/// Jobs that have not started when the options' token is cancelled report
/// [`ThumbnailError::Cancelled`] without touching their source.
///
/// ```no_run
/// use mediathumb::{MediaFile, MediaKind, PipelineOptions, ThumbnailRequest, thumbnail_batch};
///
/// let jobs = ["a.png", "b.jpg"]
///     .iter()
///     .map(|name| {
///         (
///             MediaFile::from_path(name, MediaKind::Image),
///             ThumbnailRequest::to_path(format!("{name}.thumb.jpg"), 128),
///         )
///     })
///     .collect();
/// for outcome in thumbnail_batch(jobs, &PipelineOptions::new()) {
///     println!("{:?}", outcome.result.map(|result| result.created));
/// }
/// ```
pub fn thumbnail_batch(
    jobs: Vec<(MediaFile, ThumbnailRequest<'static>)>,
    options: &PipelineOptions,
) -> Vec<ThumbnailOutcome> {
    jobs.into_par_iter()
        .map(|(media, request)| {
            if options.is_cancelled() {
                return ThumbnailOutcome {
                    media,
                    result: Err(ThumbnailError::Cancelled),
                };
            }
            media.thumbnail_on_worker(request, options)
        })
        .collect()
}
