//! Metadata-only probing.
//!
//! [`MediaProbe`] opens a source, resolves its streams and settles its
//! duration without decoding any frame or writing a thumbnail. Sources
//! without a declared duration are still scanned to the end.

use std::path::Path;

use crate::configuration::PipelineOptions;
use crate::error::ThumbnailError;
use crate::metadata::MediaMetadata;
use crate::session::ProbeSession;
use crate::source::StreamSource;

/// Metadata-only pipeline.
///
/// # Example
///
/// ```no_run
/// use mediathumb::MediaProbe;
///
/// let metadata = MediaProbe::probe_path("input.mp4")?;
/// println!("{}x{}, {:?}", metadata.width, metadata.height, metadata.duration);
/// # Ok::<(), mediathumb::ThumbnailError>(())
/// ```
pub struct MediaProbe;

impl MediaProbe {
    /// Probe a file on disk.
    pub fn probe_path<P: AsRef<Path>>(path: P) -> Result<MediaMetadata, ThumbnailError> {
        Self::probe(StreamSource::from_path(path), &PipelineOptions::default())
    }

    /// Probe any source: open, resolve streams, finalize duration.
    ///
    /// # Errors
    ///
    /// Returns [`ThumbnailError::NoMediaStreams`] when the container holds
    /// neither video nor audio, and [`ThumbnailError::Cancelled`] when the
    /// options' token fires during I/O.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::io::stdin;
    ///
    /// use mediathumb::{CancellationToken, MediaProbe, PipelineOptions, StreamSource};
    ///
    /// let token = CancellationToken::new();
    /// let options = PipelineOptions::new().with_cancellation(token.clone());
    /// // Forward-only input is read to the end to measure the duration
    /// let metadata = MediaProbe::probe(StreamSource::from_reader(stdin()), &options)?;
    /// println!("{:?}", metadata.duration);
    /// # Ok::<(), mediathumb::ThumbnailError>(())
    /// ```
    pub fn probe(
        source: StreamSource,
        options: &PipelineOptions,
    ) -> Result<MediaMetadata, ThumbnailError> {
        let mut metadata = MediaMetadata::default();
        let mut session = ProbeSession::open(source, options, &mut metadata)?;
        session.resolve_streams(&mut metadata)?;
        session.finalize_duration(&mut metadata, options)?;
        Ok(metadata)
    }

    /// Probe several files. Failures are reported per entry.
    ///
    /// ```no_run
    /// use mediathumb::MediaProbe;
    ///
    /// for result in MediaProbe::probe_many(&["a.mp4", "b.mkv"]) {
    ///     match result {
    ///         Ok(metadata) => println!("{:?}", metadata.duration),
    ///         Err(error) => eprintln!("error: {error}"),
    ///     }
    /// }
    /// ```
    pub fn probe_many<P: AsRef<Path>>(paths: &[P]) -> Vec<Result<MediaMetadata, ThumbnailError>> {
        paths.iter().map(Self::probe_path).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn garbage_is_not_media() {
        let source = StreamSource::from_read_seeker(Cursor::new(vec![0x5Au8; 4096]), true);
        assert!(MediaProbe::probe(source, &PipelineOptions::default()).is_err());
    }

    #[test]
    fn probe_many_keeps_per_entry_errors() {
        let results = MediaProbe::probe_many(&["/nonexistent/a.mp4", "/nonexistent/b.mkv"]);
        assert_eq!(results.len(), 2);
        assert!(
            results
                .iter()
                .all(|result| matches!(result, Err(ThumbnailError::FileOpen { .. })))
        );
    }
}
