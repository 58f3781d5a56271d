//! Error handling integration tests.
//!
//! These tests verify that meaningful errors are returned for the failure
//! conditions a caller can provoke.

use std::io::{Error as IoError, ErrorKind};

use mediathumb::{MediaFile, MediaKind, MediaProbe, ThumbnailError, ThumbnailRequest};

#[test]
fn open_nonexistent_file() {
    let result = MediaProbe::probe_path("this_file_does_not_exist.mp4");
    let error_message = result.unwrap_err().to_string();
    assert!(
        error_message.contains("Failed to open media"),
        "Error message should mention open failure: {error_message}",
    );
}

#[test]
fn open_invalid_file() {
    // Create a temporary file with garbage content.
    let temporary_directory = tempfile::tempdir().expect("Failed to create temp dir");
    let invalid_file_path = temporary_directory.path().join("invalid.mp4");
    std::fs::write(&invalid_file_path, b"this is not a media file")
        .expect("Failed to write invalid file");

    let result = MediaProbe::probe_path(&invalid_file_path);
    assert!(result.is_err(), "Expected error for invalid media file");
}

#[test]
fn invalid_video_yields_no_thumbnail() {
    let temporary_directory = tempfile::tempdir().expect("Failed to create temp dir");
    let input = temporary_directory.path().join("invalid.mkv");
    let output = temporary_directory.path().join("invalid.jpg");
    std::fs::write(&input, vec![0x42; 4096]).expect("Failed to write invalid file");

    let mut media = MediaFile::from_path(&input, MediaKind::Video);
    let result = media.thumbnail(ThumbnailRequest::to_path(&output, 64));
    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn second_request_reports_consumed_source() {
    let mut media = MediaFile::from_path("this_file_does_not_exist.png", MediaKind::Image);
    let _ = media.thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32));
    let error = media
        .thumbnail(ThumbnailRequest::to_writer(Vec::new(), 32))
        .unwrap_err();
    assert!(matches!(error, ThumbnailError::InvalidRequest(_)), "{error:?}");
}

#[test]
fn error_classes() {
    assert!(ThumbnailError::InvalidData.is_invalid_data());
    assert!(ThumbnailError::UnsupportedFormat("x".into()).is_unsupported());
    assert!(ThumbnailError::UnsupportedFeature("x".into()).is_unsupported());
    assert!(ThumbnailError::DecoderNotFound("x".into()).is_unsupported());
    assert!(ThumbnailError::Cancelled.is_cancelled());
    assert!(!ThumbnailError::OutOfMemory.is_unsupported());
}

#[test]
fn io_errors_convert() {
    let error: ThumbnailError = IoError::new(ErrorKind::PermissionDenied, "denied").into();
    assert!(matches!(error, ThumbnailError::Io(_)));
    assert!(error.to_string().contains("denied"));
}

#[test]
fn display_messages() {
    let error = ThumbnailError::FrameTooLarge {
        width: 20_000,
        height: 100,
        max: 16_384,
    };
    assert_eq!(
        error.to_string(),
        "Frame size 20000x100 exceeds maximum allowed dimension 16384"
    );
    assert_eq!(
        ThumbnailError::EngineShutdown("raster").to_string(),
        "The raster engine has been shut down"
    );
}
