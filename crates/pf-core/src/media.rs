//! Media-domain types shared by the decision engine and the transcoders.
//!
//! Container and codec names stay as strings because providers advertise
//! arbitrary formats; [`normalize_container`], [`normalize_video_codec`] and
//! [`normalize_audio_codec`] fold the common aliases before any comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Containers a browser can play without repackaging.
pub const DIRECT_PLAY_CONTAINERS: &[&str] = &["mp4", "webm", "mov"];

/// Audio codecs accepted for direct play.
pub const DIRECT_PLAY_AUDIO_CODECS: &[&str] = &["aac", "mp3"];

/// Audio codecs that can be carried into a new container without re-encoding.
pub const REMUX_AUDIO_CODECS: &[&str] = &["aac", "mp3", "ac3", "eac3"];

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Lowercase a container name and fold common aliases.
pub fn normalize_container(raw: &str) -> String {
    let lower = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    match lower.as_str() {
        "matroska" | "matroska,webm" => "mkv".into(),
        "quicktime" | "mov,mp4,m4a,3gp,3g2,mj2" => "mov".into(),
        "mpegts" | "mpeg-ts" => "ts".into(),
        "m4v" | "mpeg4" => "mp4".into(),
        _ => lower,
    }
}

/// Lowercase a video codec name and fold common aliases.
pub fn normalize_video_codec(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    match lower.as_str() {
        "avc" | "avc1" | "x264" | "h.264" => "h264".into(),
        "h265" | "h.265" | "hvc1" | "hev1" | "x265" => "hevc".into(),
        "av01" => "av1".into(),
        "vp09" => "vp9".into(),
        _ => lower,
    }
}

/// Lowercase an audio codec name and fold common aliases.
pub fn normalize_audio_codec(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    match lower.as_str() {
        "e-ac-3" | "ec-3" | "eac-3" => "eac3".into(),
        "ac-3" => "ac3".into(),
        "mp4a" | "aac_latm" => "aac".into(),
        "mpeg audio" | "mp3float" => "mp3".into(),
        _ => lower,
    }
}

/// Whether a codec is expensive enough to double the memory estimate.
pub fn is_complex_codec(codec: &str) -> bool {
    matches!(normalize_video_codec(codec).as_str(), "hevc" | "av1")
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Accepts `1920x1080` or a height label such as `720p` (width assumes 16:9).
impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let invalid = || Error::Validation(format!("invalid resolution '{s}'"));

        if let Some(height) = s.strip_suffix('p') {
            let height: u32 = height.parse().map_err(|_| invalid())?;
            let width = ((f64::from(height) * 16.0 / 9.0) / 2.0).round() as u32 * 2;
            return Ok(Self::new(width, height));
        }

        let (w, h) = s.split_once('x').ok_or_else(invalid)?;
        let width = w.parse().map_err(|_| invalid())?;
        let height = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

// ---------------------------------------------------------------------------
// SpeedPriority
// ---------------------------------------------------------------------------

/// Encoder trade-off between wall-clock time and output quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPriority {
    Fastest,
    #[default]
    Balanced,
    Quality,
}

impl fmt::Display for SpeedPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fastest => write!(f, "fastest"),
            Self::Balanced => write!(f, "balanced"),
            Self::Quality => write!(f, "quality"),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaCharacteristics
// ---------------------------------------------------------------------------

/// What a prober learned about a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCharacteristics {
    pub container: String,
    /// `None` when the file has no video stream.
    pub video_codec: Option<String>,
    /// `None` when the file has no audio stream.
    pub audio_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Overall bitrate in kbps, 0 when unknown.
    #[serde(default)]
    pub bitrate: u32,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl MediaCharacteristics {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// DeviceProfile
// ---------------------------------------------------------------------------

/// Playback capabilities of a client device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub name: String,
    pub containers: Vec<String>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    /// Tallest frame the device can display.
    pub max_height: u32,
    /// Bandwidth ceiling in kbps.
    pub max_bitrate: u32,
    pub supports_hdr: bool,
    pub supports_hevc: bool,
    pub supports_av1: bool,
    pub preferred_container: Option<String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "web".into(),
            containers: vec!["mp4".into(), "webm".into()],
            video_codecs: vec!["h264".into(), "vp9".into()],
            audio_codecs: vec!["aac".into(), "mp3".into(), "opus".into()],
            max_height: 1080,
            max_bitrate: 8000,
            supports_hdr: false,
            supports_hevc: false,
            supports_av1: false,
            preferred_container: Some("mp4".into()),
        }
    }
}
