use std::env;
use std::path::{Path, PathBuf};

/// Headers ffmpeg-sys-next needs under an FFmpeg prefix.
const REQUIRED_HEADERS: [&str; 3] = [
    "libavformat/avformat.h",
    "libavcodec/avcodec.h",
    "libswscale/swscale.h",
];

fn missing_headers(prefix: &Path) -> Vec<&'static str> {
    REQUIRED_HEADERS
        .into_iter()
        .filter(|header| !prefix.join("include").join(header).exists())
        .collect()
}

fn main() {
    for variable in ["FFMPEG_DIR", "VCPKG_ROOT", "VCPKGRS_TRIPLET"] {
        println!("cargo:rerun-if-env-changed={variable}");
    }

    if let Some(prefix) = env::var_os("FFMPEG_DIR").map(PathBuf::from) {
        let missing = missing_headers(&prefix);
        if !missing.is_empty() {
            println!(
                "cargo:warning=FFMPEG_DIR={} is missing {}; thumbnails need libavformat, libavcodec and libswscale headers.",
                prefix.display(),
                missing.join(", ")
            );
        }
        return;
    }

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }
    let Ok(vcpkg_root) = env::var("VCPKG_ROOT") else {
        println!(
            "cargo:warning=Set FFMPEG_DIR (or VCPKG_ROOT with an ffmpeg install) so ffmpeg-sys-next can find FFmpeg on Windows."
        );
        return;
    };
    let triplet = env::var("VCPKGRS_TRIPLET").unwrap_or_else(|_| "x64-windows".to_string());
    let prefix = PathBuf::from(vcpkg_root).join("installed").join(triplet);
    if missing_headers(&prefix).is_empty() {
        println!(
            "cargo:warning=Found FFmpeg under {}; set FFMPEG_DIR to it to skip discovery.",
            prefix.display()
        );
    } else {
        println!(
            "cargo:warning=No usable FFmpeg install under {}.",
            prefix.display()
        );
    }
}
