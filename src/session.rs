//! One demuxer session over a [`StreamSource`].
//!
//! A [`ProbeSession`] moves through `Created → FormatProbed →
//! StreamsResolved → DurationFinal` and is closed exactly once, either by
//! [`finalize_duration`](ProbeSession::finalize_duration) or by being dropped
//! on an error path. Closing deregisters the stream adapter first, then
//! closes the format context, then frees the I/O context.

use std::ffi::c_int;
use std::ptr;
use std::time::Duration;

use ffmpeg_next::{
    Error as FfmpegError, Packet, Rational,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    format::{context::Input, stream::Disposition},
    frame::Video as VideoFrame,
    media::Type,
};

use crate::adapter::StreamAdapter;
use crate::configuration::{PipelineOptions, SamplingLimits};
use crate::conversion::{elapsed_since_start, micros_to_duration, stream_start};
use crate::error::ThumbnailError;
use crate::ffmpeg::init_decode_engine;
use crate::metadata::{MediaMetadata, ORIENTATION_NORMAL, orientation_from_clockwise_degrees};
use crate::progress::{OperationType, ProgressTracker};
use crate::sampler::{CandidateFrame, FrameSource};
use crate::source::StreamSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    FormatProbed,
    StreamsResolved,
    DurationFinal,
    Closed,
}

/// Why a request produced metadata but no thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No decoder is available for the video codec.
    DecoderUnavailable,
    /// The picture exceeds the configured maximum dimension.
    TooLarge,
}

/// Result of trying to set up decoding.
#[derive(Debug)]
pub(crate) enum DecoderOutcome<T> {
    Full(T),
    DurationOnly(FallbackReason),
    Fatal(ThumbnailError),
}

/// Owner of one format context and its stream adapter.
pub(crate) struct ProbeSession {
    input: Option<Input>,
    adapter: StreamAdapter,
    state: SessionState,
    video_stream: Option<usize>,
    attached_picture: bool,
    declared_duration: bool,
}

impl ProbeSession {
    /// Probe the container format. Title, artist and any declared duration
    /// are written to `metadata`.
    pub(crate) fn open(
        source: StreamSource,
        options: &PipelineOptions,
        metadata: &mut MediaMetadata,
    ) -> Result<Self, ThumbnailError> {
        init_decode_engine()?;
        let description = source.describe();
        let adapter = StreamAdapter::new(source, options.cancellation().cloned())?;

        let input = unsafe {
            let mut context = ffmpeg_sys_next::avformat_alloc_context();
            if context.is_null() {
                return Err(ThumbnailError::OutOfMemory);
            }
            adapter.attach(context);
            let url = adapter.url().map_or(ptr::null(), |url| url.as_ptr());

            // On failure avformat_open_input frees the context itself.
            let code = ffmpeg_sys_next::avformat_open_input(
                &mut context,
                url,
                ptr::null(),
                ptr::null_mut(),
            );
            if code < 0 {
                return Err(open_error(&adapter, code));
            }

            // Streams whose codec has no decoder leave their parameters
            // incomplete and make this call fail; such containers are still
            // usable for duration and the decoder fallback.
            let code = ffmpeg_sys_next::avformat_find_stream_info(context, ptr::null_mut());
            if code < 0 {
                if (*context).nb_streams == 0 || adapter.is_cancelled() {
                    ffmpeg_sys_next::avformat_close_input(&mut context);
                    return Err(open_error(&adapter, code));
                }
                log::warn!(
                    "session {}: incomplete stream info ({}), continuing",
                    adapter.id(),
                    FfmpegError::from(code)
                );
            }
            Input::wrap(context)
        };

        let declared = micros_to_duration(input.duration());
        let tags = input.metadata();
        metadata.title = tags.get("title").map(str::to_string);
        metadata.artist = tags.get("artist").map(str::to_string);
        metadata.duration = declared;
        drop(tags);

        log::debug!(
            "session {} probed {description} as {} (declared duration: {:?})",
            adapter.id(),
            input.format().name(),
            declared
        );

        Ok(Self {
            input: Some(input),
            adapter,
            state: SessionState::FormatProbed,
            video_stream: None,
            attached_picture: false,
            declared_duration: declared.is_some(),
        })
    }

    fn input(&mut self) -> Result<&mut Input, ThumbnailError> {
        self.input
            .as_mut()
            .ok_or_else(|| ThumbnailError::Internal("session already closed".to_string()))
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), ThumbnailError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ThumbnailError::Internal(format!(
                "session in state {:?}, expected {expected:?}",
                self.state
            )))
        }
    }

    /// Pick the best video stream and note whether audio exists.
    ///
    /// Media without video keeps zero dimensions and reports
    /// `has_video = false`.
    pub(crate) fn resolve_streams(&mut self, metadata: &mut MediaMetadata) -> Result<(), ThumbnailError> {
        self.expect_state(SessionState::FormatProbed)?;
        let input = self.input()?;
        let streams = input.streams();
        let video = streams.best(Type::Video);
        let audio = streams.best(Type::Audio);

        metadata.has_audio = audio.is_some();
        metadata.has_video = video.is_some();

        let mut resolved = None;
        if let Some(stream) = video {
            let (width, height) = unsafe {
                let parameters = stream.parameters();
                let raw = parameters.as_ptr();
                ((*raw).width.max(0) as u32, (*raw).height.max(0) as u32)
            };
            let orientation = stream_orientation(&stream);
            let attached = stream.disposition().contains(Disposition::ATTACHED_PIC);
            metadata.set_picture(width, height, orientation);
            resolved = Some((stream.index(), attached));
        } else if audio.is_none() {
            return Err(ThumbnailError::NoMediaStreams);
        }

        if let Some((index, attached)) = resolved {
            self.video_stream = Some(index);
            self.attached_picture = attached;
        }
        self.state = SessionState::StreamsResolved;

        log::debug!(
            "session {} resolved streams: video={:?} (attached picture: {}), audio={}",
            self.adapter.id(),
            self.video_stream,
            self.attached_picture,
            metadata.has_audio
        );
        Ok(())
    }

    pub(crate) fn has_video(&self) -> bool {
        self.video_stream.is_some()
    }

    /// Whether the video stream is a single attached picture (cover art).
    pub(crate) fn is_attached_picture(&self) -> bool {
        self.attached_picture
    }

    /// Whether the container declared its own duration.
    pub(crate) fn has_declared_duration(&self) -> bool {
        self.declared_duration
    }

    /// Open a decoder for the selected video stream.
    ///
    /// A missing decoder or an oversized picture degrade to duration-only
    /// output; any other failure is fatal.
    pub(crate) fn create_decoder(&mut self, limits: &SamplingLimits) -> DecoderOutcome<VideoDecoder> {
        if let Err(error) = self.expect_state(SessionState::StreamsResolved) {
            return DecoderOutcome::Fatal(error);
        }
        let Some(index) = self.video_stream else {
            return DecoderOutcome::Fatal(ThumbnailError::Internal(
                "no video stream to decode".to_string(),
            ));
        };
        let input = match self.input() {
            Ok(input) => input,
            Err(error) => return DecoderOutcome::Fatal(error),
        };
        let Some(stream) = input.stream(index) else {
            return DecoderOutcome::Fatal(ThumbnailError::Internal(format!(
                "video stream {index} disappeared"
            )));
        };

        let context = match CodecContext::from_parameters(stream.parameters()) {
            Ok(context) => context,
            Err(error) => return DecoderOutcome::Fatal(error.into()),
        };
        let (width, height) = unsafe {
            let raw = context.as_ptr();
            ((*raw).width.max(0) as u32, (*raw).height.max(0) as u32)
        };
        if !limits.allows(width, height) {
            log::warn!(
                "video is {width}x{height}, larger than {} per side; skipping thumbnail",
                limits.max_dimension
            );
            return DecoderOutcome::DurationOnly(FallbackReason::TooLarge);
        }

        match context.decoder().video() {
            Ok(decoder) => DecoderOutcome::Full(decoder),
            Err(FfmpegError::DecoderNotFound) => {
                let codec = unsafe { (*stream.parameters().as_ptr()).codec_id };
                log::warn!("no decoder for codec {codec:?}; skipping thumbnail");
                DecoderOutcome::DurationOnly(FallbackReason::DecoderUnavailable)
            }
            Err(error) => DecoderOutcome::Fatal(error.into()),
        }
    }

    /// Frames of the selected video stream, decoded with `decoder`.
    pub(crate) fn frames<'a>(
        &'a mut self,
        decoder: &'a mut VideoDecoder,
    ) -> Result<SessionFrames<'a>, ThumbnailError> {
        self.expect_state(SessionState::StreamsResolved)?;
        let index = self
            .video_stream
            .ok_or_else(|| ThumbnailError::Internal("no video stream to decode".to_string()))?;
        let input = self.input()?;
        let (time_base, start) = input
            .stream(index)
            .map(|stream| (stream.time_base(), stream_start(stream.start_time())))
            .unwrap_or_else(|| (Rational::new(0, 1), 0));
        Ok(SessionFrames {
            input,
            decoder,
            stream_index: index,
            time_base,
            start,
            flushing: false,
        })
    }

    /// Settle the duration and close the session.
    ///
    /// A declared duration is kept as is. Otherwise the remaining packets
    /// are read from the current position and the duration becomes the
    /// larger of the sampled estimate already in `metadata` and the scanned
    /// one. The session is closed whatever the outcome.
    pub(crate) fn finalize_duration(
        mut self,
        metadata: &mut MediaMetadata,
        options: &PipelineOptions,
    ) -> Result<(), ThumbnailError> {
        let result = self.scan_duration(metadata, options);
        self.close();
        result
    }

    fn scan_duration(
        &mut self,
        metadata: &mut MediaMetadata,
        options: &PipelineOptions,
    ) -> Result<(), ThumbnailError> {
        if self.state == SessionState::Closed {
            return Err(ThumbnailError::Internal("session already closed".to_string()));
        }
        if self.declared_duration {
            self.state = SessionState::DurationFinal;
            return Ok(());
        }

        let id = self.adapter.id();
        let input = self.input()?;
        let timing: Vec<(Rational, i64)> = input
            .streams()
            .map(|stream| (stream.time_base(), stream_start(stream.start_time())))
            .collect();

        let mut tracker = ProgressTracker::new(
            options.progress.clone(),
            OperationType::DurationScan,
            None,
            options.batch_size,
        );
        let mut scanned: Option<Duration> = None;
        let mut packet = Packet::empty();
        loop {
            if options.is_cancelled() {
                return Err(ThumbnailError::Cancelled);
            }
            match packet.read(input) {
                Ok(()) => {}
                Err(FfmpegError::Eof) => break,
                Err(FfmpegError::Exit) => return Err(ThumbnailError::Cancelled),
                Err(error) => {
                    log::warn!("duration scan of session {id} stopped early: {error}");
                    break;
                }
            }
            let Some(&(time_base, start)) = timing.get(packet.stream()) else {
                continue;
            };
            let Some(pts) = packet.pts().or(packet.dts()) else {
                continue;
            };
            let end = pts.saturating_add(packet.duration().max(0));
            let end = elapsed_since_start(end, start, time_base);
            if let Some(end) = end {
                scanned = Some(scanned.map_or(end, |longest| longest.max(end)));
            }
            tracker.advance(end);
        }
        tracker.finish();

        log::debug!(
            "session {id} scanned {} packet(s): scan={scanned:?}, sampled={:?}",
            tracker.current(),
            metadata.duration
        );
        if let Some(scanned) = scanned {
            metadata.raise_duration(scanned);
        }
        self.state = SessionState::DurationFinal;
        Ok(())
    }

    /// Deregister the adapter, then close the format context. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.adapter.deregister();
        drop(self.input.take());
        self.state = SessionState::Closed;
    }

    #[cfg(test)]
    pub(crate) fn session_id(&self) -> crate::adapter::SessionId {
        self.adapter.id()
    }
}

impl Drop for ProbeSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_error(adapter: &StreamAdapter, code: c_int) -> ThumbnailError {
    if adapter.is_cancelled() {
        return ThumbnailError::Cancelled;
    }
    if let Some(error) = adapter.take_io_error() {
        return ThumbnailError::Io(error);
    }
    ThumbnailError::from(FfmpegError::from(code))
}

/// Orientation from the stream's display matrix, falling back to the
/// legacy `rotate` tag.
fn stream_orientation(stream: &ffmpeg_next::format::stream::Stream<'_>) -> u8 {
    let from_matrix = unsafe {
        let parameters = stream.parameters();
        let raw = parameters.as_ptr();
        let side_data = ffmpeg_sys_next::av_packet_side_data_get(
            (*raw).coded_side_data,
            (*raw).nb_coded_side_data,
            ffmpeg_sys_next::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
        );
        if !side_data.is_null() && (*side_data).size >= 9 * size_of::<i32>() {
            // The matrix stores a counter-clockwise angle.
            let counter_clockwise =
                ffmpeg_sys_next::av_display_rotation_get((*side_data).data as *const i32);
            Some(orientation_from_clockwise_degrees(-counter_clockwise))
        } else {
            None
        }
    };

    from_matrix
        .or_else(|| {
            stream
                .metadata()
                .get("rotate")
                .and_then(|value| value.trim().parse::<f64>().ok())
                .map(orientation_from_clockwise_degrees)
        })
        .unwrap_or(ORIENTATION_NORMAL)
}

/// Decoded frames of one video stream, pulled packet by packet.
pub(crate) struct SessionFrames<'a> {
    input: &'a mut Input,
    decoder: &'a mut VideoDecoder,
    stream_index: usize,
    time_base: Rational,
    start: i64,
    flushing: bool,
}

impl FrameSource for SessionFrames<'_> {
    fn next_frame(&mut self) -> Result<Option<CandidateFrame>, ThumbnailError> {
        loop {
            let mut frame = VideoFrame::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let timestamp = frame
                        .timestamp()
                        .or(frame.pts())
                        .and_then(|pts| elapsed_since_start(pts, self.start, self.time_base));
                    return Ok(Some(CandidateFrame { frame, timestamp }));
                }
                Err(FfmpegError::Eof) => return Ok(None),
                Err(FfmpegError::Other { errno }) if errno == ffmpeg_next::error::EAGAIN => {
                    if self.flushing {
                        return Ok(None);
                    }
                }
                Err(error) => return Err(error.into()),
            }

            let mut packet = Packet::empty();
            match packet.read(self.input) {
                Ok(()) if packet.stream() == self.stream_index => {
                    self.decoder.send_packet(&packet)?;
                }
                Ok(()) => {}
                Err(FfmpegError::Eof) => {
                    self.decoder.send_eof()?;
                    self.flushing = true;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
