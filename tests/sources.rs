//! Source handling integration tests: readers, growing files, cancellation.

use std::io::{Cursor, Write};
use std::thread;
use std::time::Duration;

use image::{ImageFormat, Rgba, RgbaImage};
use mediathumb::{
    CancellationToken, GrowingFile, MediaFile, MediaKind, MediaProbe, PipelineOptions,
    StreamSource, ThumbnailError, ThumbnailRequest,
};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, _| {
        Rgba([(x % 256) as u8, 90, 30, if x % 2 == 0 { 255 } else { 128 }])
    });
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("Failed to encode PNG");
    bytes.into_inner()
}

#[test]
fn forward_only_reader_is_drained() {
    let mut media = MediaFile::from_reader(Cursor::new(png_bytes(120, 40)), MediaKind::Image);
    let mut out = Vec::new();
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(&mut out, 60))
        .expect("Thumbnail failed");

    assert!(result.created && result.has_alpha);
    assert_eq!((result.width, result.height), (60, 20));
    assert_eq!(&out[1..4], b"PNG");
}

#[test]
fn seekable_reader_is_drained() {
    let mut media =
        MediaFile::from_read_seeker(Cursor::new(png_bytes(40, 40)), true, MediaKind::Image);
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 20))
        .expect("Thumbnail failed");
    assert_eq!((result.width, result.height), (20, 20));
}

#[test]
fn growing_file_is_read_once_complete() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("upload.png");
    let bytes = png_bytes(90, 30);

    let mut producer = GrowingFile::create(&path).expect("Failed to create growing file");
    let reader = producer.reader().expect("Failed to open reader");
    let writer = thread::spawn(move || {
        for chunk in bytes.chunks(64) {
            producer.write_all(chunk).expect("Failed to write chunk");
            thread::sleep(Duration::from_millis(1));
        }
        producer.finish().expect("Failed to finish")
    });

    let mut media = MediaFile::from_read_seeker(reader, false, MediaKind::Image);
    let result = media
        .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 45))
        .expect("Thumbnail failed");
    let written = writer.join().expect("Producer panicked");

    assert!(written > 0);
    assert_eq!((result.width, result.height), (45, 15));
    assert_eq!(media.metadata().width, 90);
}

#[test]
fn cancelled_request_writes_nothing() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let output = dir.path().join("never.jpg");
    let token = CancellationToken::new();
    token.cancel();
    let options = PipelineOptions::new().with_cancellation(token);

    let mut media = MediaFile::from_reader(Cursor::new(png_bytes(10, 10)), MediaKind::Image);
    let error = media
        .thumbnail_with_options(ThumbnailRequest::to_path(&output, 8), &options)
        .unwrap_err();
    assert!(error.is_cancelled());
    assert!(!output.exists());
}

#[test]
fn cancelled_video_request_is_interrupted() {
    let token = CancellationToken::new();
    token.cancel();
    let options = PipelineOptions::new().with_cancellation(token);

    let mut out = Vec::new();
    let mut media = MediaFile::from_reader(Cursor::new(vec![0u8; 8192]), MediaKind::Video);
    let error = media
        .thumbnail_with_options(ThumbnailRequest::to_writer(&mut out, 64), &options)
        .unwrap_err();
    assert!(error.is_cancelled(), "unexpected error: {error:?}");
    assert!(out.is_empty());
}

#[test]
fn garbage_video_is_an_error() {
    let mut out = Vec::new();
    let mut media = MediaFile::from_reader(
        Cursor::new(b"definitely not a container".repeat(100)),
        MediaKind::Video,
    );
    let result = media.thumbnail(ThumbnailRequest::to_writer(&mut out, 64));
    assert!(result.is_err());
    assert!(out.is_empty());
    assert!(media.metadata().duration.is_none());
}

#[test]
fn probe_reports_missing_files() {
    let result = MediaProbe::probe(
        StreamSource::from_path("this_file_does_not_exist.mp4"),
        &PipelineOptions::new(),
    );
    match result {
        Err(ThumbnailError::FileOpen { path, .. }) => {
            assert!(path.ends_with("this_file_does_not_exist.mp4"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
