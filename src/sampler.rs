//! Bounded, overlapped decode-and-score sampling.
//!
//! The sampler decodes up to `max_frames` candidates on the calling thread
//! and hands each one through a bounded channel to a [`HistogramScorer`]
//! running on a scoped worker. Scoring of frame *n* overlaps decoding of the
//! frames after it; the channel is the only shared state. Once decoding
//! stops the channel is closed and the sampler waits for the scorer to drain
//! it before selecting a frame.

use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use ffmpeg_next::frame::Video as VideoFrame;

use crate::configuration::PipelineOptions;
use crate::conversion::{FrameConverter, PackedFrame, frame_bytes};
use crate::error::ThumbnailError;
use crate::histogram::{HistogramScorer, ScoredFrames};
use crate::progress::{OperationType, ProgressTracker};

/// A decoded frame and its presentation time.
pub(crate) struct CandidateFrame {
    pub(crate) frame: VideoFrame,
    pub(crate) timestamp: Option<Duration>,
}

impl CandidateFrame {
    #[cfg(test)]
    pub(crate) fn new(frame: VideoFrame, timestamp: Option<Duration>) -> Self {
        Self { frame, timestamp }
    }
}

/// Anything that yields decoded video frames in presentation order.
pub(crate) trait FrameSource {
    /// The next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<CandidateFrame>, ThumbnailError>;
}

/// The representative frame, converted for the raster stage.
#[derive(Debug)]
pub(crate) struct SampledFrame {
    pub(crate) packed: PackedFrame,
    pub(crate) has_alpha: bool,
    pub(crate) selected_index: usize,
    pub(crate) frames_scored: usize,
}

/// Drives one sampling pass and remembers the latest timestamp it saw,
/// whether or not the pass succeeds.
#[derive(Debug, Default)]
pub(crate) struct DecodeSampler {
    latest_timestamp: Option<Duration>,
    frames_decoded: usize,
}

impl DecodeSampler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Largest presentation time among decoded frames.
    pub(crate) fn latest_timestamp(&self) -> Option<Duration> {
        self.latest_timestamp
    }

    pub(crate) fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }

    fn note(&mut self, candidate: &CandidateFrame) {
        self.frames_decoded += 1;
        if let Some(timestamp) = candidate.timestamp {
            if self.latest_timestamp.is_none_or(|latest| timestamp > latest) {
                self.latest_timestamp = Some(timestamp);
            }
        }
    }

    /// Sample `source` and return the representative frame.
    ///
    /// `single_frame` caps sampling at one frame (cover art). `orientation`
    /// is carried through to the converted frame.
    pub(crate) fn run<S: FrameSource>(
        &mut self,
        source: &mut S,
        options: &PipelineOptions,
        single_frame: bool,
        orientation: u8,
    ) -> Result<SampledFrame, ThumbnailError> {
        if options.is_cancelled() {
            return Err(ThumbnailError::Cancelled);
        }
        let first = source.next_frame()?.ok_or(ThumbnailError::NoDecodableFrames)?;
        let (width, height) = (first.frame.width(), first.frame.height());
        let limits = options.limits();
        if !limits.allows(width, height) {
            return Err(ThumbnailError::FrameTooLarge {
                width,
                height,
                max: limits.max_dimension,
            });
        }
        self.note(&first);

        let max_frames = if single_frame {
            1
        } else {
            limits.max_frames_for(frame_bytes(first.frame.format(), width, height))
        };
        log::debug!(
            "sampling up to {max_frames} frame(s) of {width}x{height} {:?}",
            first.frame.format()
        );

        let mut tracker = ProgressTracker::new(
            options.progress.clone(),
            OperationType::FrameSampling,
            Some(max_frames as u64),
            options.batch_size,
        );
        tracker.advance(first.timestamp);

        let (sender, receiver) = bounded::<CandidateFrame>(max_frames);
        let (decoded, scored) = thread::scope(|scope| {
            let scorer = scope.spawn(move || -> Result<ScoredFrames, ThumbnailError> {
                let mut scorer = HistogramScorer::new();
                for candidate in receiver {
                    scorer.score(candidate)?;
                }
                Ok(scorer.finish())
            });

            let decoded = (|| -> Result<(), ThumbnailError> {
                if sender.send(first).is_err() {
                    return Ok(());
                }
                for _ in 1..max_frames {
                    if options.is_cancelled() {
                        return Err(ThumbnailError::Cancelled);
                    }
                    let Some(candidate) = source.next_frame()? else {
                        break;
                    };
                    self.note(&candidate);
                    tracker.advance(candidate.timestamp);
                    // The scorer only hangs up after failing; its error is
                    // reported from the join below.
                    if sender.send(candidate).is_err() {
                        break;
                    }
                }
                Ok(())
            })();
            drop(sender);

            let scored = scorer
                .join()
                .unwrap_or_else(|_| Err(ThumbnailError::Internal("histogram scorer panicked".to_string())));
            (decoded, scored)
        });
        tracker.finish();

        decoded?;
        let scored = scored?;
        let has_alpha = scored.has_alpha;
        let frames_scored = scored.frames.len();
        let (selected_index, winner) = scored
            .into_selected()
            .ok_or(ThumbnailError::NoDecodableFrames)?;
        log::debug!(
            "selected frame {selected_index} of {frames_scored} at {:?} (alpha: {has_alpha})",
            winner.timestamp
        );

        let packed = FrameConverter::convert(&winner.frame, has_alpha, orientation)?;
        Ok(SampledFrame {
            packed,
            has_alpha,
            selected_index,
            frames_scored,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use ffmpeg_next::format::Pixel;

    use super::*;
    use crate::progress::{CancellationToken, ProgressCallback, ProgressInfo};

    fn frame(pixel: Pixel, width: u32, height: u32, fill: impl Fn(usize) -> u8) -> VideoFrame {
        let mut frame = VideoFrame::new(pixel, width, height);
        for (index, byte) in frame.data_mut(0).iter_mut().enumerate() {
            *byte = fill(index);
        }
        frame
    }

    fn black(width: u32, height: u32) -> VideoFrame {
        frame(Pixel::RGB24, width, height, |_| 0)
    }

    fn busy(width: u32, height: u32) -> VideoFrame {
        frame(Pixel::RGB24, width, height, |index| ((index * 37) % 251) as u8)
    }

    struct Scripted {
        frames: VecDeque<Result<CandidateFrame, ThumbnailError>>,
        pulled: usize,
    }

    impl Scripted {
        fn new(frames: Vec<Result<VideoFrame, ThumbnailError>>) -> Self {
            let frames = frames
                .into_iter()
                .enumerate()
                .map(|(index, frame)| {
                    frame.map(|frame| {
                        CandidateFrame::new(frame, Some(Duration::from_millis(index as u64 * 40)))
                    })
                })
                .collect();
            Self { frames, pulled: 0 }
        }
    }

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Option<CandidateFrame>, ThumbnailError> {
            self.pulled += 1;
            self.frames.pop_front().transpose()
        }
    }

    #[test]
    fn selects_past_black_lead_in() {
        let mut source = Scripted::new(vec![
            Ok(black(32, 16)),
            Ok(black(32, 16)),
            Ok(busy(32, 16)),
            Ok(busy(32, 16)),
        ]);
        let mut sampler = DecodeSampler::new();
        let sampled = sampler
            .run(&mut source, &PipelineOptions::new(), false, 1)
            .unwrap();
        assert_eq!(sampled.selected_index, 2);
        assert_eq!(sampled.frames_scored, 4);
        assert!(!sampled.has_alpha);
        assert_eq!(sampled.packed.bands, 3);
        assert_eq!(sampler.latest_timestamp(), Some(Duration::from_millis(120)));
    }

    #[test]
    fn never_decodes_more_than_the_cap() {
        let frames = (0..10).map(|_| Ok(busy(16, 16))).collect();
        let mut source = Scripted::new(frames);
        let mut sampler = DecodeSampler::new();
        let options = PipelineOptions::new().with_max_frames(3);
        let sampled = sampler.run(&mut source, &options, false, 1).unwrap();
        assert_eq!(sampled.frames_scored, 3);
        assert_eq!(sampler.frames_decoded(), 3);
        assert_eq!(source.pulled, 3);
    }

    #[test]
    fn cover_art_samples_one_frame() {
        let frames = (0..4).map(|_| Ok(busy(16, 16))).collect();
        let mut source = Scripted::new(frames);
        let sampled = DecodeSampler::new()
            .run(&mut source, &PipelineOptions::new(), true, 1)
            .unwrap();
        assert_eq!(sampled.frames_scored, 1);
        assert_eq!(source.pulled, 1);
    }

    #[test]
    fn empty_stream_has_no_decodable_frames() {
        let mut source = Scripted::new(Vec::new());
        let error = DecodeSampler::new()
            .run(&mut source, &PipelineOptions::new(), false, 1)
            .unwrap_err();
        assert!(matches!(error, ThumbnailError::NoDecodableFrames));
    }

    #[test]
    fn first_frame_error_is_fatal() {
        let mut source = Scripted::new(vec![Err(ThumbnailError::InvalidData)]);
        let mut sampler = DecodeSampler::new();
        let error = sampler
            .run(&mut source, &PipelineOptions::new(), false, 1)
            .unwrap_err();
        assert!(error.is_invalid_data());
        assert_eq!(sampler.frames_decoded(), 0);
    }

    #[test]
    fn later_decode_error_aborts_but_keeps_timestamps() {
        let mut source = Scripted::new(vec![
            Ok(busy(16, 16)),
            Ok(busy(16, 16)),
            Err(ThumbnailError::InvalidData),
        ]);
        let mut sampler = DecodeSampler::new();
        let error = sampler
            .run(&mut source, &PipelineOptions::new(), false, 1)
            .unwrap_err();
        assert!(error.is_invalid_data());
        assert_eq!(sampler.latest_timestamp(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn oversized_first_frame_is_rejected() {
        let mut source = Scripted::new(vec![Ok(busy(64, 16))]);
        let options = PipelineOptions::new().with_max_dimension(32);
        let error = DecodeSampler::new()
            .run(&mut source, &options, false, 1)
            .unwrap_err();
        assert!(matches!(
            error,
            ThumbnailError::FrameTooLarge {
                width: 64,
                height: 16,
                max: 32
            }
        ));
    }

    #[test]
    fn alpha_formats_produce_rgba() {
        let mut source = Scripted::new(vec![Ok(frame(Pixel::RGBA, 16, 16, |index| {
            if index % 4 == 3 { 128 } else { (index % 200) as u8 }
        }))]);
        let sampled = DecodeSampler::new()
            .run(&mut source, &PipelineOptions::new(), false, 1)
            .unwrap();
        assert!(sampled.has_alpha);
        assert_eq!(sampled.packed.bands, 4);
        assert_eq!(sampled.packed.data.len(), 16 * 16 * 4);
    }

    #[test]
    fn cancellation_stops_sampling() {
        struct CancelAfterFirst {
            token: CancellationToken,
        }
        impl FrameSource for CancelAfterFirst {
            fn next_frame(&mut self) -> Result<Option<CandidateFrame>, ThumbnailError> {
                self.token.cancel();
                Ok(Some(CandidateFrame::new(busy(16, 16), None)))
            }
        }

        let token = CancellationToken::new();
        let options = PipelineOptions::new().with_cancellation(token.clone());
        let mut source = CancelAfterFirst { token };
        let error = DecodeSampler::new()
            .run(&mut source, &options, false, 1)
            .unwrap_err();
        assert!(error.is_cancelled());
    }

    #[test]
    fn reports_sampling_progress() {
        #[derive(Default)]
        struct Count(Mutex<Vec<(OperationType, u64)>>);
        impl ProgressCallback for Count {
            fn on_progress(&self, info: &ProgressInfo) {
                self.0.lock().unwrap().push((info.operation, info.current));
            }
        }

        let progress = Arc::new(Count::default());
        let options = PipelineOptions::new()
            .with_progress(progress.clone())
            .with_batch_size(2);
        let frames = (0..3).map(|_| Ok(busy(16, 16))).collect();
        let mut source = Scripted::new(frames);
        DecodeSampler::new().run(&mut source, &options, false, 1).unwrap();

        let reports = progress.0.lock().unwrap();
        assert_eq!(
            *reports,
            vec![(OperationType::FrameSampling, 2), (OperationType::FrameSampling, 3)]
        );
    }
}
