//! Media metadata and orientation helpers.
//!
//! [`MediaMetadata`] is filled in stage by stage: container tags and any
//! declared duration after probing, dimensions and orientation after stream
//! resolution, and the final duration after finalization. Reported
//! dimensions are display dimensions, already swapped for orientations that
//! rotate by a quarter turn.

use std::time::Duration;

/// Orientation code for an upright image.
pub const ORIENTATION_NORMAL: u8 = 1;

/// Everything known about a piece of media after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMetadata {
    /// Display width in pixels. Zero when there is no picture.
    pub width: u32,
    /// Display height in pixels. Zero when there is no picture.
    pub height: u32,
    /// EXIF orientation code, 1 through 8.
    pub orientation: u8,
    /// Playback duration, when it could be determined.
    pub duration: Option<Duration>,
    /// Container `title` tag.
    pub title: Option<String>,
    /// Container `artist` tag.
    pub artist: Option<String>,
    /// Whether a video stream (including cover art) is present.
    pub has_video: bool,
    /// Whether an audio stream is present.
    pub has_audio: bool,
}

impl Default for MediaMetadata {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            orientation: ORIENTATION_NORMAL,
            duration: None,
            title: None,
            artist: None,
            has_video: false,
            has_audio: false,
        }
    }
}

impl MediaMetadata {
    /// Record decoded dimensions and orientation, swapping width and height
    /// when the orientation implies a quarter turn.
    pub(crate) fn set_picture(&mut self, width: u32, height: u32, orientation: u8) {
        let orientation = normalize_orientation(orientation);
        let (width, height) = display_dimensions(width, height, orientation);
        self.width = width;
        self.height = height;
        self.orientation = orientation;
    }

    /// Raise the duration to `candidate` if it is longer than what is known.
    pub(crate) fn raise_duration(&mut self, candidate: Duration) {
        if self.duration.is_none_or(|known| candidate > known) {
            self.duration = Some(candidate);
        }
    }
}

/// Clamp unknown codes to [`ORIENTATION_NORMAL`].
pub fn normalize_orientation(orientation: u8) -> u8 {
    if (1..=8).contains(&orientation) {
        orientation
    } else {
        ORIENTATION_NORMAL
    }
}

/// Whether `orientation` turns the picture by 90 or 270 degrees.
pub fn swaps_dimensions(orientation: u8) -> bool {
    (5..=8).contains(&orientation)
}

/// Dimensions after applying `orientation` to a `width`×`height` picture.
///
/// ```
/// use mediathumb::display_dimensions;
///
/// assert_eq!(display_dimensions(1920, 1080, 6), (1080, 1920));
/// assert_eq!(display_dimensions(1920, 1080, 3), (1920, 1080));
/// ```
pub fn display_dimensions(width: u32, height: u32, orientation: u8) -> (u32, u32) {
    if swaps_dimensions(orientation) {
        (height, width)
    } else {
        (width, height)
    }
}

/// Orientation code for a clockwise rotation in degrees.
///
/// Angles are rounded to the nearest quarter turn; anything else maps to
/// [`ORIENTATION_NORMAL`].
pub fn orientation_from_clockwise_degrees(degrees: f64) -> u8 {
    if !degrees.is_finite() {
        return ORIENTATION_NORMAL;
    }
    let quarter_turns = (degrees / 90.0).round() as i64;
    match quarter_turns.rem_euclid(4) {
        1 => 6,
        2 => 3,
        3 => 8,
        _ => ORIENTATION_NORMAL,
    }
}
