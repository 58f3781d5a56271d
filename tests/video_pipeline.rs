//! Decode pipeline integration tests.
//!
//! Tests require fixture files from `tests/fixtures/generate_fixtures.sh`
//! and return early when a fixture is missing.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediathumb::{
    MediaFile, MediaKind, MediaProbe, OperationType, PipelineOptions, ProgressCallback,
    ProgressInfo, StreamSource, ThumbnailRequest, swaps_dimensions,
};

fn fixture(name: &str) -> Option<String> {
    let path = format!("tests/fixtures/{name}");
    Path::new(&path).exists().then_some(path)
}

fn assert_close(actual: Option<Duration>, expected: Duration, tolerance: Duration) {
    let actual = actual.expect("duration should be known");
    let difference = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        difference <= tolerance,
        "duration {actual:?} not within {tolerance:?} of {expected:?}"
    );
}

#[derive(Default)]
struct Recorder(Mutex<Vec<OperationType>>);

impl ProgressCallback for Recorder {
    fn on_progress(&self, info: &ProgressInfo) {
        self.0.lock().unwrap().push(info.operation);
    }
}

#[test]
fn video_file_yields_thumbnail_and_duration() {
    let Some(path) = fixture("sample_video.mp4") else {
        return;
    };
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let output = dir.path().join("thumb.jpg");

    let recorder = Arc::new(Recorder::default());
    let options = PipelineOptions::new().with_progress(recorder.clone());
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail_with_options(ThumbnailRequest::to_path(&output, 160), &options)
        .expect("Thumbnail failed");

    assert!(result.created);
    assert!(!result.has_alpha);
    assert_eq!((result.width, result.height), (160, 90));
    assert!(output.exists());

    let metadata = media.metadata();
    assert_eq!((metadata.width, metadata.height), (640, 360));
    assert!(metadata.has_video && metadata.has_audio);
    assert_close(metadata.duration, Duration::from_secs(5), Duration::from_millis(100));

    let operations = recorder.0.lock().unwrap();
    assert!(operations.contains(&OperationType::FrameSampling));
    assert!(operations.contains(&OperationType::ThumbnailRender));
}

#[test]
fn forward_only_stream_scans_duration() {
    let Some(path) = fixture("sample_video.ts") else {
        return;
    };
    let file = File::open(&path).expect("Failed to open fixture");
    let mut media = MediaFile::from_reader(file, MediaKind::Video);
    let mut bytes = Vec::new();
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(&mut bytes, 128))
        .expect("Thumbnail failed");

    assert!(result.created);
    assert!(!bytes.is_empty());
    // One frame interval at 25 fps.
    assert_close(
        media.metadata().duration,
        Duration::from_secs(5),
        Duration::from_millis(40) + Duration::from_millis(100),
    );
}

#[test]
fn sampling_every_frame_keeps_duration_relative_to_start() {
    let Some(path) = fixture("sample_video.ts") else {
        return;
    };
    // The cap covers the whole clip, so the sampled timestamps alone
    // decide the duration.
    let options = PipelineOptions::new().with_max_frames(1000);
    let file = File::open(&path).expect("Failed to open fixture");
    let mut media = MediaFile::from_reader(file, MediaKind::Video);
    let result = media
        .thumbnail_with_options(ThumbnailRequest::to_writer(Vec::new(), 64), &options)
        .expect("Thumbnail failed");

    assert!(result.created);
    assert_close(
        media.metadata().duration,
        Duration::from_secs(5),
        Duration::from_millis(40) + Duration::from_millis(100),
    );
}

#[test]
fn long_stream_without_declared_duration() {
    let Some(path) = fixture("sample_long.ts") else {
        return;
    };
    let options = PipelineOptions::new().with_max_frames(30);
    let file = File::open(&path).expect("Failed to open fixture");
    let mut media = MediaFile::from_reader(file, MediaKind::Video);
    let result = media
        .thumbnail_with_options(ThumbnailRequest::to_writer(Vec::new(), 64), &options)
        .expect("Thumbnail failed");

    assert!(result.created);
    assert!(!result.has_alpha);
    assert_close(
        media.metadata().duration,
        Duration::from_secs(120),
        Duration::from_millis(40) + Duration::from_millis(100),
    );
}

#[test]
fn frame_cap_does_not_change_the_outcome() {
    let Some(path) = fixture("sample_video.mp4") else {
        return;
    };
    let options = PipelineOptions::new().with_max_frames(1);
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail_with_options(ThumbnailRequest::to_writer(Vec::new(), 64), &options)
        .expect("Thumbnail failed");
    assert!(result.created);
    assert_eq!(result.width, 64);
}

#[test]
fn audio_only_reports_duration_without_thumbnail() {
    let Some(path) = fixture("sample_audio_only.mp3") else {
        return;
    };
    let mut bytes = Vec::new();
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(&mut bytes, 128))
        .expect("Audio should not be an error");

    assert!(!result.created);
    assert!(result.fallback.is_none());
    assert!(bytes.is_empty());
    assert_eq!(media.kind(), MediaKind::Audio);
    assert!(!media.metadata().has_video);
    assert_close(media.metadata().duration, Duration::from_secs(3), Duration::from_millis(150));
}

#[test]
fn oversized_video_falls_back_to_duration_only() {
    let Some(path) = fixture("sample_video.mp4") else {
        return;
    };
    let options = PipelineOptions::new().with_max_dimension(320);
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail_with_options(ThumbnailRequest::to_writer(Vec::new(), 64), &options)
        .expect("Oversized video should not be an error");

    assert!(!result.created);
    assert_eq!(result.fallback, Some(mediathumb::FallbackReason::TooLarge));
    assert!(media.metadata().duration.is_some());
}

#[test]
fn rotation_swaps_reported_dimensions() {
    let Some(path) = fixture("sample_rotated.mp4") else {
        return;
    };
    let metadata = MediaProbe::probe_path(&path).expect("Probe failed");
    assert!(swaps_dimensions(metadata.orientation));
    assert_eq!((metadata.width, metadata.height), (360, 640));

    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 128))
        .expect("Thumbnail failed");
    assert_eq!((result.width, result.height), (72, 128));
}

#[test]
fn alpha_video_keeps_transparency() {
    let Some(path) = fixture("sample_alpha.webm") else {
        return;
    };
    let mut bytes = Vec::new();
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(&mut bytes, 64))
        .expect("Thumbnail failed");
    // Only when the decoder exposes the alpha plane.
    if result.has_alpha {
        assert_eq!(&bytes[1..4], b"PNG");
    }
    assert!(result.created);
}

#[test]
fn probe_matches_pipeline_metadata() {
    let Some(path) = fixture("sample_video.mp4") else {
        return;
    };
    let probed = MediaProbe::probe(StreamSource::from_path(&path), &PipelineOptions::new())
        .expect("Probe failed");
    let mut media = MediaFile::from_path(&path, MediaKind::Video);
    media
        .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 64))
        .expect("Thumbnail failed");
    assert_eq!(&probed, media.metadata());
}
