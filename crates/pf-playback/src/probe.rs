//! Media probing.
//!
//! [`MediaProbe`] is the seam to whatever extracts [`MediaCharacteristics`]
//! from a file. [`FfprobeProber`] shells out to
//! `ffprobe -v quiet -print_format json -show_format -show_streams`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use pf_core::tools::ToolCommand;
use pf_core::{normalize_audio_codec, normalize_container, normalize_video_codec, Error, MediaCharacteristics, Result};

/// Upper bound on a single ffprobe run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Extracts media characteristics from a file.
///
/// Implementations must be safe to share across threads.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Human-readable name identifying this prober implementation.
    fn name(&self) -> &'static str;

    /// Probe the file at `path`.
    async fn probe(&self, path: &Path) -> Result<MediaCharacteristics>;
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self { ffprobe_path }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProber {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn probe(&self, path: &Path) -> Result<MediaCharacteristics> {
        if !path.exists() {
            return Err(Error::not_found("media file", path.display()));
        }

        let output = ToolCommand::new(self.ffprobe_path.clone())
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path.to_string_lossy())
            .timeout(PROBE_TIMEOUT)
            .execute()
            .await?;

        parse_ffprobe_json(path, &output.stdout)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Map ffprobe JSON output for `path` into [`MediaCharacteristics`].
pub fn parse_ffprobe_json(path: &Path, json: &str) -> Result<MediaCharacteristics> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let container = map_container(output.format.format_name.as_deref().unwrap_or(""), path);
    if container.is_empty() {
        return Err(Error::Probe(format!("unknown container for {}", path.display())));
    }

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaCharacteristics {
        container,
        video_codec: video.and_then(|s| s.codec_name.as_deref()).map(normalize_video_codec),
        audio_codec: audio.and_then(|s| s.codec_name.as_deref()).map(normalize_audio_codec),
        width: video.and_then(|s| s.width).unwrap_or(0),
        height: video.and_then(|s| s.height).unwrap_or(0),
        bitrate: output
            .format
            .bit_rate
            .and_then(|b| b.parse::<u64>().ok())
            .map_or(0, |bps| u32::try_from(bps / 1000).unwrap_or(u32::MAX)),
        duration_secs: output.format.duration.and_then(|d| d.parse().ok()),
    })
}

/// ffprobe reports the whole ISO-BMFF family as one demuxer, so the file
/// extension disambiguates mp4 from mov.
fn map_container(format_name: &str, path: &Path) -> String {
    let extension = path
        .extension()
        .map(|e| normalize_container(&e.to_string_lossy()))
        .unwrap_or_default();

    if format_name.starts_with("mov,mp4") {
        return match extension.as_str() {
            "mov" => "mov".into(),
            _ => "mp4".into(),
        };
    }
    if format_name == "matroska,webm" {
        return match extension.as_str() {
            "webm" => "webm".into(),
            _ => "mkv".into(),
        };
    }

    let first = format_name.split(',').next().unwrap_or("");
    if first.is_empty() {
        extension
    } else {
        normalize_container(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MKV_HEVC: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160},
            {"codec_type": "audio", "codec_name": "eac3"},
            {"codec_type": "subtitle", "codec_name": "subrip"}
        ],
        "format": {"format_name": "matroska,webm", "duration": "7200.5", "bit_rate": "25000000"}
    }"#;

    #[test]
    fn parses_matroska() {
        let m = parse_ffprobe_json(Path::new("/m/film.mkv"), MKV_HEVC).unwrap();
        assert_eq!(m.container, "mkv");
        assert_eq!(m.video_codec.as_deref(), Some("hevc"));
        assert_eq!(m.audio_codec.as_deref(), Some("eac3"));
        assert_eq!((m.width, m.height), (3840, 2160));
        assert_eq!(m.bitrate, 25_000);
        assert_eq!(m.duration_secs, Some(7200.5));
    }

    #[test]
    fn webm_extension_wins_over_matroska_demuxer() {
        let m = parse_ffprobe_json(Path::new("/m/clip.webm"), MKV_HEVC).unwrap();
        assert_eq!(m.container, "webm");
    }

    #[test]
    fn mov_family_uses_extension() {
        let json = r#"{"streams":[{"codec_type":"video","codec_name":"h264","width":1280,"height":720}],
                       "format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2"}}"#;
        assert_eq!(parse_ffprobe_json(Path::new("/m/a.mp4"), json).unwrap().container, "mp4");
        assert_eq!(parse_ffprobe_json(Path::new("/m/a.MOV"), json).unwrap().container, "mov");
        let m = parse_ffprobe_json(Path::new("/m/a.m4v"), json).unwrap();
        assert_eq!(m.container, "mp4");
        assert!(m.audio_codec.is_none());
        assert_eq!(m.bitrate, 0);
    }

    #[test]
    fn invalid_json_is_probe_error() {
        let err = parse_ffprobe_json(Path::new("/m/a.mp4"), "not json").unwrap_err();
        assert!(matches!(err, Error::Probe(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let prober = FfprobeProber::new(PathBuf::from("ffprobe"));
        let err = prober.probe(Path::new("/definitely/not/here.mkv")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
