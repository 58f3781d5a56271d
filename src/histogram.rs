//! Candidate scoring and representative-frame selection.
//!
//! Every candidate is reduced to a normalized 3×256 RGB histogram computed
//! on a copy no larger than [`HISTOGRAM_EDGE`] pixels on its long side. The
//! representative frame is the candidate closest (squared distance) to the
//! mean histogram of all eligible candidates; ties go to the earliest frame.
//! Near-black frames and frames dominated by a single brightness level
//! (fades, title cards, blank slates) are not eligible unless nothing else
//! is.

use ffmpeg_next::{
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};

use crate::conversion::pixel_has_alpha;
use crate::error::ThumbnailError;
use crate::sampler::CandidateFrame;

/// Long side of the scoring copy.
pub(crate) const HISTOGRAM_EDGE: u32 = 128;

const BINS: usize = 256;
const MIN_MEAN_LUMA: f32 = 20.0 / 255.0;
const MAX_DOMINANT_SHARE: f32 = 0.97;

/// Normalized per-channel histogram plus the brightness figures used for
/// eligibility.
#[derive(Debug, Clone)]
pub(crate) struct Histogram {
    bins: Vec<f32>,
    mean_luma: f32,
    dominant_share: f32,
}

impl Histogram {
    /// Histogram of packed RGB24 samples.
    pub(crate) fn from_rgb(data: &[u8]) -> Self {
        let mut counts = vec![0u32; 3 * BINS];
        let mut luma_buckets = [0u32; 16];
        let mut luma_sum = 0u64;
        let mut pixels = 0u32;

        for pixel in data.chunks_exact(3) {
            let (r, g, b) = (pixel[0], pixel[1], pixel[2]);
            counts[r as usize] += 1;
            counts[BINS + g as usize] += 1;
            counts[2 * BINS + b as usize] += 1;
            let luma = (77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b)) >> 8;
            luma_sum += u64::from(luma);
            luma_buckets[(luma >> 4) as usize] += 1;
            pixels += 1;
        }

        if pixels == 0 {
            return Self {
                bins: vec![0.0; 3 * BINS],
                mean_luma: 0.0,
                dominant_share: 1.0,
            };
        }

        let total = pixels as f32;
        let dominant = luma_buckets.iter().copied().max().unwrap_or(0);
        Self {
            bins: counts.into_iter().map(|count| count as f32 / total).collect(),
            mean_luma: luma_sum as f32 / total / 255.0,
            dominant_share: dominant as f32 / total,
        }
    }

    fn is_eligible(&self) -> bool {
        self.mean_luma >= MIN_MEAN_LUMA && self.dominant_share < MAX_DOMINANT_SHARE
    }

    fn distance_squared(&self, other: &[f32]) -> f32 {
        self.bins
            .iter()
            .zip(other)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Index of the representative histogram, or `None` for an empty slice.
pub(crate) fn select_representative(histograms: &[Histogram]) -> Option<usize> {
    if histograms.is_empty() {
        return None;
    }
    let eligible: Vec<usize> = (0..histograms.len())
        .filter(|&index| histograms[index].is_eligible())
        .collect();
    let pool: Vec<usize> = if eligible.is_empty() {
        (0..histograms.len()).collect()
    } else {
        eligible
    };

    let mut mean = vec![0.0f32; 3 * BINS];
    for &index in &pool {
        for (sum, value) in mean.iter_mut().zip(&histograms[index].bins) {
            *sum += value;
        }
    }
    let count = pool.len() as f32;
    mean.iter_mut().for_each(|sum| *sum /= count);

    let mut best: Option<(usize, f32)> = None;
    for &index in &pool {
        let distance = histograms[index].distance_squared(&mean);
        if best.is_none_or(|(_, closest)| distance < closest) {
            best = Some((index, distance));
        }
    }
    best.map(|(index, _)| index)
}

/// Dimensions of the scoring copy of a `width`×`height` frame.
pub(crate) fn scoring_dimensions(width: u32, height: u32) -> (u32, u32) {
    let long = width.max(height);
    if long <= HISTOGRAM_EDGE {
        return (width.max(1), height.max(1));
    }
    let scale = f64::from(HISTOGRAM_EDGE) / f64::from(long);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, HISTOGRAM_EDGE);
    (scaled(width), scaled(height))
}

/// Everything the scorer hands back once the channel is drained.
pub(crate) struct ScoredFrames {
    pub(crate) frames: Vec<CandidateFrame>,
    pub(crate) histograms: Vec<Histogram>,
    pub(crate) has_alpha: bool,
}

impl ScoredFrames {
    /// Keep the representative frame and release every other candidate.
    pub(crate) fn into_selected(self) -> Option<(usize, CandidateFrame)> {
        let index = select_representative(&self.histograms)?;
        let winner = self.frames.into_iter().nth(index)?;
        Some((index, winner))
    }
}

type ScalerKey = (Pixel, u32, u32);

/// Scores candidates in arrival order and keeps them for selection.
pub(crate) struct HistogramScorer {
    scaler: Option<(ScalerKey, ScalingContext)>,
    scaled: VideoFrame,
    scored: ScoredFrames,
}

impl HistogramScorer {
    pub(crate) fn new() -> Self {
        Self {
            scaler: None,
            scaled: VideoFrame::empty(),
            scored: ScoredFrames {
                frames: Vec::new(),
                histograms: Vec::new(),
                has_alpha: false,
            },
        }
    }

    pub(crate) fn score(&mut self, candidate: CandidateFrame) -> Result<(), ThumbnailError> {
        let frame = &candidate.frame;
        let key = (frame.format(), frame.width(), frame.height());
        if self.scaler.as_ref().is_none_or(|(current, _)| *current != key) {
            let (width, height) = scoring_dimensions(key.1, key.2);
            let context = ScalingContext::get(
                key.0,
                key.1,
                key.2,
                Pixel::RGB24,
                width,
                height,
                ScalingFlags::AREA,
            )?;
            self.scaler = Some((key, context));
            self.scaled = VideoFrame::empty();
        }
        let Some((_, scaler)) = self.scaler.as_mut() else {
            return Err(ThumbnailError::Internal("scaler missing".to_string()));
        };
        scaler.run(frame, &mut self.scaled)?;

        let rgb = crate::conversion::frame_to_buffer(
            &self.scaled,
            self.scaled.width(),
            self.scaled.height(),
            3,
        )?;
        self.scored.has_alpha |= pixel_has_alpha(key.0);
        self.scored.histograms.push(Histogram::from_rgb(&rgb));
        self.scored.frames.push(candidate);
        Ok(())
    }

    pub(crate) fn finish(self) -> ScoredFrames {
        self.scored
    }
}
