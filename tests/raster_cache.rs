//! Raster cache integration test.
//!
//! The cache is process-wide, so everything runs in a single test.

use image::{Rgb, RgbImage};
use mediathumb::{CacheLimits, RasterEngine, ThreadContext, ThumbnailRequest};

#[test]
fn cache_tracks_and_bounds_operations() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let first = dir.path().join("first.png");
    let second = dir.path().join("second.png");
    RgbImage::from_pixel(100, 100, Rgb([9, 9, 9]))
        .save(&first)
        .expect("Failed to write PNG");
    RgbImage::from_pixel(50, 50, Rgb([200, 9, 9]))
        .save(&second)
        .expect("Failed to write PNG");

    RasterEngine::init().expect("Raster engine failed to start");
    RasterEngine::set_cache_limits(CacheLimits::default());
    RasterEngine::drop_all_cache();

    let mut context = ThreadContext::enter().expect("Failed to enter raster context");
    context
        .render_file(&first, ThumbnailRequest::to_writer(Vec::new(), 10))
        .expect("Render failed");

    // One load and one thumbnail: 100*100*3 + 10*10*3 bytes.
    let profile = RasterEngine::memory_profile();
    assert_eq!(profile.allocations, 2);
    assert_eq!(profile.files, 1);
    assert_eq!(profile.memory, 30_000 + 300);

    // Same request again is served from the cache.
    let again = context
        .render_file(&first, ThumbnailRequest::to_writer(Vec::new(), 10))
        .expect("Cached render failed");
    assert_eq!((again.width, again.height), (10, 10));
    assert_eq!(RasterEngine::memory_profile().allocations, 2);

    RasterEngine::set_cache_max_files(1);
    context
        .render_file(&second, ThumbnailRequest::to_writer(Vec::new(), 10))
        .expect("Render failed");
    let profile = RasterEngine::memory_profile();
    assert_eq!(profile.files, 1);
    assert_eq!(RasterEngine::cache_limits().max_files, 1);

    RasterEngine::set_cache_max_operations(1);
    assert_eq!(RasterEngine::memory_profile().allocations, 1);

    RasterEngine::drop_all_cache();
    let profile = RasterEngine::memory_profile();
    assert_eq!((profile.memory, profile.allocations, profile.files), (0, 0, 0));
    assert!(profile.high_water >= 30_300);

    RasterEngine::set_cache_max_memory(0);
    context
        .render_file(&first, ThumbnailRequest::to_writer(Vec::new(), 10))
        .expect("Uncached render failed");
    assert_eq!(RasterEngine::memory_profile().allocations, 0);

    drop(context);
    RasterEngine::thread_shutdown().expect("Thread teardown failed");
}
