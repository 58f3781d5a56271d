//! Decode-engine process scope.
//!
//! The FFmpeg libraries are set up once per process through
//! [`init_decode_engine`], which is idempotent and is also called implicitly
//! by every pipeline entry point. After [`shutdown_decode_engine`] the engine
//! refuses further requests with [`ThumbnailError::EngineShutdown`].
//!
//! FFmpeg also prints its own diagnostics to stderr, independently of the
//! `log` facade used by this crate. [`set_ffmpeg_log_level`] tunes that
//! output.
//!
//! ```no_run
//! use mediathumb::FfmpegLogLevel;
//!
//! mediathumb::set_ffmpeg_log_level(FfmpegLogLevel::Error);
//! mediathumb::init_decode_engine()?;
//! # Ok::<(), mediathumb::ThumbnailError>(())
//! ```

use std::str::FromStr;

use ffmpeg_next::util::log::Level;

use crate::engine::EngineLifecycle;
use crate::error::ThumbnailError;

static DECODE_ENGINE: EngineLifecycle = EngineLifecycle::new("decode");

/// Initialise the decode engine. Safe to call any number of times.
pub fn init_decode_engine() -> Result<(), ThumbnailError> {
    DECODE_ENGINE.ensure_ready(|| ffmpeg_next::init().map_err(ThumbnailError::from))
}

/// Shut the decode engine down for the rest of the process.
///
/// Sessions that are already open keep working until they are closed; new
/// requests fail with [`ThumbnailError::EngineShutdown`]. Calling this twice
/// is harmless.
pub fn shutdown_decode_engine() {
    DECODE_ENGINE.shutdown(|| unsafe {
        ffmpeg_sys_next::avformat_network_deinit();
    });
}

/// FFmpeg's own console verbosity, quietest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfmpegLogLevel {
    /// Nothing at all.
    Quiet,
    /// Only conditions that abort the process.
    Panic,
    /// Unrecoverable errors.
    Fatal,
    /// Recoverable errors.
    Error,
    /// Warnings. FFmpeg's default.
    Warning,
    /// Informational messages.
    Info,
    /// Verbose informational messages.
    Verbose,
    /// Debugging output.
    Debug,
    /// Everything.
    Trace,
}

impl From<FfmpegLogLevel> for Level {
    fn from(level: FfmpegLogLevel) -> Self {
        match level {
            FfmpegLogLevel::Quiet => Level::Quiet,
            FfmpegLogLevel::Panic => Level::Panic,
            FfmpegLogLevel::Fatal => Level::Fatal,
            FfmpegLogLevel::Error => Level::Error,
            FfmpegLogLevel::Warning => Level::Warning,
            FfmpegLogLevel::Info => Level::Info,
            FfmpegLogLevel::Verbose => Level::Verbose,
            FfmpegLogLevel::Debug => Level::Debug,
            FfmpegLogLevel::Trace => Level::Trace,
        }
    }
}

impl From<Level> for FfmpegLogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Quiet => FfmpegLogLevel::Quiet,
            Level::Panic => FfmpegLogLevel::Panic,
            Level::Fatal => FfmpegLogLevel::Fatal,
            Level::Error => FfmpegLogLevel::Error,
            Level::Warning => FfmpegLogLevel::Warning,
            Level::Info => FfmpegLogLevel::Info,
            Level::Verbose => FfmpegLogLevel::Verbose,
            Level::Debug => FfmpegLogLevel::Debug,
            Level::Trace => FfmpegLogLevel::Trace,
        }
    }
}

impl FromStr for FfmpegLogLevel {
    type Err = ThumbnailError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quiet" => Ok(FfmpegLogLevel::Quiet),
            "panic" => Ok(FfmpegLogLevel::Panic),
            "fatal" => Ok(FfmpegLogLevel::Fatal),
            "error" => Ok(FfmpegLogLevel::Error),
            "warning" | "warn" => Ok(FfmpegLogLevel::Warning),
            "info" => Ok(FfmpegLogLevel::Info),
            "verbose" => Ok(FfmpegLogLevel::Verbose),
            "debug" => Ok(FfmpegLogLevel::Debug),
            "trace" => Ok(FfmpegLogLevel::Trace),
            other => Err(ThumbnailError::InvalidRequest(format!(
                "unknown FFmpeg log level: {other}"
            ))),
        }
    }
}

/// Set FFmpeg's stderr verbosity. Does not touch the `log` facade.
pub fn set_ffmpeg_log_level(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level.into());
}

/// Current FFmpeg stderr verbosity, if it maps to a known level.
pub fn get_ffmpeg_log_level() -> Option<FfmpegLogLevel> {
    ffmpeg_next::util::log::get_level().ok().map(FfmpegLogLevel::from)
}
