use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use mediathumb::{
    AlphaPolicy, FfmpegLogLevel, MediaFile, MediaKind, MediaMetadata, MediaProbe, PipelineOptions,
    ProgressCallback, ProgressInfo, RasterEngine, StreamSource, ThumbnailRequest, ThumbnailResult,
};
use serde_json::{Value, json};

const CLI_AFTER_HELP: &str = "Examples:\n  mediathumb thumbnail movie.mp4 --out movie.jpg --size 320\n  mediathumb thumbnail *.png --out thumbs --size 128 --progress\n  cat clip.webm | mediathumb thumbnail - --kind video --out clip.jpg\n  mediathumb probe song.mp3 --json\n  mediathumb completions zsh > _mediathumb";

#[derive(Debug, Parser)]
#[command(
    name = "mediathumb",
    version,
    about = "Make thumbnails and read durations of video, audio and image files",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long)]
    verbose: bool,

    /// Show progress while sampling and rendering.
    #[arg(long)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long)]
    overwrite: bool,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum number of cached raster operations.
    #[arg(long)]
    cache_max_operations: Option<usize>,

    /// Maximum bytes held by the raster cache.
    #[arg(long)]
    cache_max_memory: Option<usize>,

    /// Maximum number of source files held by the raster cache.
    #[arg(long)]
    cache_max_files: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a thumbnail for each input.
    #[command(
        about = "Generate thumbnails",
        after_help = "With one input, --out is the thumbnail file. With several, --out is a\ndirectory and each thumbnail is named after its input (.jpg, or .png when\nit keeps transparency)."
    )]
    Thumbnail {
        /// Input paths; `-` reads standard input.
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Output file (one input) or directory (several inputs).
        #[arg(long)]
        out: PathBuf,
        /// Longest side of the thumbnail, in pixels.
        #[arg(long, default_value_t = 256)]
        size: u32,
        /// JPEG quality, 0 to 100.
        #[arg(long, default_value_t = mediathumb::DEFAULT_QUALITY)]
        quality: u8,
        /// Media kind: auto, video, audio, image, other, or a MIME type.
        #[arg(long, default_value = "auto")]
        kind: String,
        /// Flatten transparency onto this colour (hex, e.g. ffffff).
        #[arg(long)]
        flatten: Option<String>,
        /// Maximum number of frames to sample.
        #[arg(long)]
        max_frames: Option<usize>,
        /// Largest frame side that will be decoded.
        #[arg(long)]
        max_dimension: Option<u32>,
        /// Print results as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print metadata for a media file.
    #[command(
        about = "Print media metadata",
        visible_alias = "info",
        after_help = "Examples:\n  mediathumb probe input.mp4\n  mediathumb probe input.mp4 --json"
    )]
    Probe {
        /// Input path; `-` reads standard input.
        input: String,

        /// Output metadata as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_kind(value: &str) -> Option<MediaKind> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => None,
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Audio),
        "image" => Some(MediaKind::Image),
        "other" => Some(MediaKind::Other),
        mime => Some(MediaKind::from_mime_type(mime)),
    }
}

fn kind_for_path(path: &Path) -> MediaKind {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" | "mov" | "mkv" | "webm" | "avi" | "wmv" | "flv" | "mpg" | "mpeg" | "ts"
        | "3gp" | "ogv" => MediaKind::Video,
        "mp3" | "m4a" | "aac" | "flac" | "wav" | "ogg" | "oga" | "opus" | "wma" | "aiff" => {
            MediaKind::Audio
        }
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "ico" => {
            MediaKind::Image
        }
        _ => MediaKind::Other,
    }
}

fn parse_hex_color(value: &str) -> Option<[u8; 3]> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |index: usize| u8::from_str_radix(&hex[index..index + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Thumbnail path for `input` inside `directory`.
fn output_path(directory: &Path, input: &str, index: usize, has_alpha: bool) -> PathBuf {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && *stem != "-")
        .map_or_else(|| format!("stdin-{index}"), str::to_string);
    let extension = if has_alpha { "png" } else { "jpg" };
    directory.join(format!("{stem}.{extension}"))
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn open_source(input: &str) -> StreamSource {
    if input == "-" {
        StreamSource::from_reader(io::stdin())
    } else {
        StreamSource::from_path(input)
    }
}

fn resolve_kind(input: &str, requested: Option<MediaKind>) -> Result<MediaKind, Box<dyn std::error::Error>> {
    match requested {
        Some(kind) => Ok(kind),
        None if input == "-" => Err("--kind is required when reading standard input".into()),
        None => Ok(kind_for_path(Path::new(input))),
    }
}

fn apply_global_options(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(level) = &global.log_level {
        let parsed: FfmpegLogLevel = level
            .parse()
            .map_err(|_| format!("unsupported --log-level: {level}"))?;
        mediathumb::set_ffmpeg_log_level(parsed);
    }

    if let Some(max) = global.cache_max_operations {
        RasterEngine::set_cache_max_operations(max);
    }
    if let Some(max) = global.cache_max_memory {
        RasterEngine::set_cache_max_memory(max);
    }
    if let Some(max) = global.cache_max_files {
        RasterEngine::set_cache_max_files(max);
    }
    RasterEngine::init()?;

    if global.verbose {
        eprintln!("{} {:?}", "cache limits".cyan().bold(), RasterEngine::cache_limits());
    }
    Ok(())
}

#[derive(Default)]
struct TerminalProgress;

impl TerminalProgress {
    fn new() -> Self {
        Self
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        match info.total {
            Some(total) => eprintln!(
                "{} {:?} {}/{}",
                "progress".cyan().bold(),
                info.operation,
                info.current,
                total
            ),
            None => eprintln!(
                "{} {:?} {}",
                "progress".cyan().bold(),
                info.operation,
                info.current
            ),
        }
    }
}

fn duration_seconds(duration: Option<Duration>) -> Option<f64> {
    duration.map(|duration| duration.as_secs_f64())
}

fn metadata_json(metadata: &MediaMetadata) -> Value {
    json!({
        "width": metadata.width,
        "height": metadata.height,
        "orientation": metadata.orientation,
        "duration_seconds": duration_seconds(metadata.duration),
        "title": metadata.title,
        "artist": metadata.artist,
        "has_video": metadata.has_video,
        "has_audio": metadata.has_audio,
    })
}

fn result_json(input: &str, output: Option<&Path>, media: &MediaFile, result: &ThumbnailResult) -> Value {
    json!({
        "input": input,
        "output": output.map(|path| path.display().to_string()),
        "kind": format!("{:?}", media.kind()).to_ascii_lowercase(),
        "created": result.created,
        "width": result.width,
        "height": result.height,
        "has_alpha": result.has_alpha,
        "fallback": result.fallback.map(|reason| format!("{reason:?}")),
        "metadata": metadata_json(media.metadata()),
    })
}

struct ThumbnailArgs {
    out: PathBuf,
    size: u32,
    quality: u8,
    kind: Option<MediaKind>,
    alpha: AlphaPolicy,
    json: bool,
}

/// Render one input to memory, then write it next to the others.
fn thumbnail_one(
    input: &str,
    index: usize,
    many: bool,
    args: &ThumbnailArgs,
    options: &PipelineOptions,
    global: &GlobalOptions,
) -> Result<Value, Box<dyn std::error::Error>> {
    let kind = resolve_kind(input, args.kind)?;
    let mut media = MediaFile::new(open_source(input), kind);
    let mut encoded = Vec::new();
    let request = ThumbnailRequest::to_writer(&mut encoded, args.size)
        .with_quality(args.quality)
        .with_alpha_policy(args.alpha);
    let result = media.thumbnail_with_options(request, options)?;

    let output = if result.created {
        let path = if many {
            output_path(&args.out, input, index, result.has_alpha)
        } else {
            args.out.clone()
        };
        ensure_writable_path(&path, global.overwrite)?;
        fs::write(&path, &encoded)?;
        Some(path)
    } else {
        None
    };

    if !args.json {
        match (&output, result.fallback) {
            (Some(path), _) => {
                println!(
                    "{} {} ({}x{})",
                    "saved".green().bold(),
                    path.display(),
                    result.width,
                    result.height
                );
            }
            (None, Some(reason)) => eprintln!(
                "{} {input}: no thumbnail ({reason:?})",
                "warning:".yellow().bold()
            ),
            (None, None) => eprintln!("{} {input}: no picture to thumbnail", "note:".cyan().bold()),
        }
        if global.verbose {
            eprintln!("{} {:?}", "metadata".cyan().bold(), media.metadata());
        }
    }
    Ok(result_json(input, output.as_deref(), &media, &result))
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Thumbnail {
            inputs,
            out,
            size,
            quality,
            kind,
            flatten,
            max_frames,
            max_dimension,
            json,
        } => {
            if inputs.iter().filter(|input| *input == "-").count() > 1 {
                return Err("standard input can only be read once".into());
            }
            let alpha = match flatten {
                Some(color) => AlphaPolicy::FlattenOnto(
                    parse_hex_color(&color).ok_or(format!("invalid --flatten colour: {color}"))?,
                ),
                None => AlphaPolicy::Preserve,
            };
            let args = ThumbnailArgs {
                out,
                size,
                quality,
                kind: parse_kind(&kind),
                alpha,
                json,
            };

            let mut options = PipelineOptions::new();
            if let Some(frames) = max_frames {
                options = options.with_max_frames(frames);
            }
            if let Some(dimension) = max_dimension {
                options = options.with_max_dimension(dimension);
            }

            let many = inputs.len() > 1;
            if many {
                fs::create_dir_all(&args.out)?;
            }
            let bar = if many && cli.global.progress {
                let bar = ProgressBar::new(inputs.len() as u64);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}",
                    )?
                    .progress_chars("=>-"),
                );
                Some(bar)
            } else {
                if cli.global.progress {
                    options = options.with_progress(Arc::new(TerminalProgress::new()));
                }
                None
            };

            let mut records = Vec::new();
            let mut failures = 0usize;
            for (index, input) in inputs.iter().enumerate() {
                if let Some(bar) = &bar {
                    bar.set_message(input.clone());
                }
                match thumbnail_one(input, index, many, &args, &options, &cli.global) {
                    Ok(record) => records.push(record),
                    Err(error) => {
                        failures += 1;
                        if json {
                            records.push(json!({ "input": input, "error": error.to_string() }));
                        } else {
                            eprintln!("{} {input}: {error}", "error:".red().bold());
                        }
                    }
                }
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
            }
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            RasterEngine::thread_shutdown()?;

            if json {
                let payload = if many {
                    Value::Array(records)
                } else {
                    records.into_iter().next().unwrap_or(Value::Null)
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            if cli.global.verbose {
                eprintln!("{} {:?}", "memory".cyan().bold(), RasterEngine::memory_profile());
            }
            if failures > 0 {
                return Err(format!("{failures} of {} input(s) failed", inputs.len()).into());
            }
        }
        Commands::Probe { input, json } => {
            let mut options = PipelineOptions::new();
            if cli.global.progress {
                options = options.with_progress(Arc::new(TerminalProgress::new()));
            }
            let metadata = MediaProbe::probe(open_source(&input), &options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metadata_json(&metadata))?);
            } else {
                if let Some(title) = &metadata.title {
                    println!("Title: {title}");
                }
                if let Some(artist) = &metadata.artist {
                    println!("Artist: {artist}");
                }
                println!("Duration: {:?}", metadata.duration);
                if metadata.has_video {
                    println!(
                        "Video: {}x{} (orientation {})",
                        metadata.width, metadata.height, metadata.orientation
                    );
                }
                println!("Audio: {}", if metadata.has_audio { "yes" } else { "no" });
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "mediathumb", &mut io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_aliases() {
        assert_eq!(parse_kind("auto"), None);
        assert_eq!(parse_kind("VIDEO"), Some(MediaKind::Video));
        assert_eq!(parse_kind("image/webp"), Some(MediaKind::Image));
        assert_eq!(parse_kind("application/pdf"), Some(MediaKind::Other));
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(kind_for_path(Path::new("a/b.MKV")), MediaKind::Video);
        assert_eq!(kind_for_path(Path::new("song.flac")), MediaKind::Audio);
        assert_eq!(kind_for_path(Path::new("x.jpeg")), MediaKind::Image);
        assert_eq!(kind_for_path(Path::new("README")), MediaKind::Other);
    }

    #[test]
    fn stdin_needs_explicit_kind() {
        assert!(resolve_kind("-", None).is_err());
        assert_eq!(resolve_kind("-", Some(MediaKind::Audio)).unwrap(), MediaKind::Audio);
    }

    #[test]
    fn hex_colours() {
        assert_eq!(parse_hex_color("#ff8000"), Some([255, 128, 0]));
        assert_eq!(parse_hex_color("FFFFFF"), Some([255, 255, 255]));
        assert_eq!(parse_hex_color("fff"), None);
        assert_eq!(parse_hex_color("gg0000"), None);
    }

    #[test]
    fn output_names_follow_input_and_alpha() {
        let dir = Path::new("thumbs");
        assert_eq!(output_path(dir, "clips/a.mp4", 0, false), dir.join("a.jpg"));
        assert_eq!(output_path(dir, "logo.png", 1, true), dir.join("logo.png"));
        assert_eq!(output_path(dir, "-", 2, false), dir.join("stdin-2.jpg"));
    }

    #[test]
    fn cli_parses_thumbnail_command() {
        let cli = Cli::try_parse_from([
            "mediathumb",
            "--cache-max-files",
            "4",
            "thumbnail",
            "a.mp4",
            "b.png",
            "--out",
            "thumbs",
            "--size",
            "128",
        ])
        .unwrap();
        assert_eq!(cli.global.cache_max_files, Some(4));
        match cli.command {
            Commands::Thumbnail { inputs, size, quality, .. } => {
                assert_eq!(inputs, vec!["a.mp4", "b.png"]);
                assert_eq!(size, 128);
                assert_eq!(quality, mediathumb::DEFAULT_QUALITY);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
