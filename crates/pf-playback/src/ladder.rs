//! Adaptive-bitrate ladder generation.
//!
//! A ladder is built from a fixed ascending table of target heights. Rungs
//! taller than the source are skipped, widths follow the source aspect ratio
//! (rounded to an even pixel count), and video bitrates are scaled by the
//! requested quality. Everything here is pure and deterministic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fraction of measured bandwidth a rung may consume.
const BANDWIDTH_HEADROOM: f64 = 0.8;

/// Quality value that maps to the table's nominal bitrates.
const NOMINAL_QUALITY: f64 = 80.0;

const MIN_QUALITY_MULTIPLIER: f64 = 0.5;
const MAX_QUALITY_MULTIPLIER: f64 = 1.2;

/// Aspect ratio assumed when the source dimensions are unknown.
const FALLBACK_ASPECT: f64 = 16.0 / 9.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// H.264 profile of a rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Main => "main",
            Self::High => "high",
        }
    }

    /// `profile_idc` as it appears in an RFC 6381 codec string.
    fn idc_hex(&self) -> &'static str {
        match self {
            Self::Baseline => "42",
            Self::Main => "4D",
            Self::High => "64",
        }
    }
}

impl fmt::Display for H264Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encode target of an ABR ladder. Bitrates are in kbps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateLadderRung {
    pub width: u32,
    pub height: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub profile: H264Profile,
    pub level: String,
    pub crf: u8,
    pub label: String,
    pub use_case: String,
}

impl BitrateLadderRung {
    /// Combined audio and video bitrate in kbps.
    pub fn total_bitrate(&self) -> u32 {
        self.video_bitrate + self.audio_bitrate
    }

    /// RFC 6381 codec string for this rung's video stream.
    pub fn codec_string(&self) -> Option<String> {
        avc_codec_string(self.profile, &self.level)
    }
}

struct RungTemplate {
    height: u32,
    video_bitrate: u32,
    audio_bitrate: u32,
    profile: H264Profile,
    level: &'static str,
    crf: u8,
    label: &'static str,
    use_case: &'static str,
}

const STANDARD_RUNGS: &[RungTemplate] = &[
    RungTemplate {
        height: 480,
        video_bitrate: 700,
        audio_bitrate: 96,
        profile: H264Profile::Main,
        level: "3.1",
        crf: 28,
        label: "480p",
        use_case: "mobile/WiFi",
    },
    RungTemplate {
        height: 720,
        video_bitrate: 1500,
        audio_bitrate: 96,
        profile: H264Profile::Main,
        level: "4.0",
        crf: 26,
        label: "720p",
        use_case: "broadband",
    },
    RungTemplate {
        height: 1080,
        video_bitrate: 2800,
        audio_bitrate: 128,
        profile: H264Profile::High,
        level: "4.1",
        crf: 24,
        label: "1080p",
        use_case: "fiber/excellent",
    },
];

const FALLBACK_RUNG: RungTemplate = RungTemplate {
    height: 240,
    video_bitrate: 300,
    audio_bitrate: 64,
    profile: H264Profile::Baseline,
    level: "3.0",
    crf: 28,
    label: "240p",
    use_case: "fallback",
};

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Bitrate multiplier for a 0..=100 quality setting.
pub fn quality_multiplier(quality: u8) -> f64 {
    (f64::from(quality) / NOMINAL_QUALITY).clamp(MIN_QUALITY_MULTIPLIER, MAX_QUALITY_MULTIPLIER)
}

/// Round to the nearest even integer (encoders require even dimensions).
fn round_to_even(value: f64) -> u32 {
    let even = ((value / 2.0).round() * 2.0) as u32;
    even.max(2)
}

/// Build the ladder for a source of the given dimensions.
///
/// The result is ascending, never taller than the source, and never empty:
/// when no table entry fits, a single low-bitrate fallback rung is returned.
pub fn generate_ladder(source_width: u32, source_height: u32, quality: u8) -> Vec<BitrateLadderRung> {
    let aspect = if source_width > 0 && source_height > 0 {
        f64::from(source_width) / f64::from(source_height)
    } else {
        FALLBACK_ASPECT
    };
    let multiplier = quality_multiplier(quality);

    let mut ladder: Vec<BitrateLadderRung> = STANDARD_RUNGS
        .iter()
        .filter(|t| t.height <= source_height)
        .map(|t| {
            let rung = build_rung(t, t.height, aspect, multiplier);
            tracing::debug!(
                label = t.label,
                width = rung.width,
                height = rung.height,
                bitrate = rung.video_bitrate,
                use_case = t.use_case,
                "Added ladder rung"
            );
            rung
        })
        .collect();

    if ladder.is_empty() {
        let height = if source_height == 0 {
            FALLBACK_RUNG.height
        } else {
            FALLBACK_RUNG.height.min(source_height - source_height % 2).max(2)
        };
        let rung = build_rung(&FALLBACK_RUNG, height, aspect, 1.0);
        tracing::warn!(source_height, "Source resolution too low, using fallback rung only");
        ladder.push(rung);
    }

    tracing::debug!(
        rungs = ladder.len(),
        source_height,
        quality,
        "Generated ABR ladder"
    );
    ladder
}

fn build_rung(t: &RungTemplate, height: u32, aspect: f64, multiplier: f64) -> BitrateLadderRung {
    BitrateLadderRung {
        width: round_to_even(f64::from(height) * aspect),
        height,
        video_bitrate: (f64::from(t.video_bitrate) * multiplier) as u32,
        audio_bitrate: t.audio_bitrate,
        profile: t.profile,
        level: t.level.to_string(),
        crf: t.crf,
        label: t.label.to_string(),
        use_case: t.use_case.to_string(),
    }
}

/// Richest rung whose combined bitrate fits in 80% of `available_kbps`.
///
/// Falls back to the lowest rung when nothing fits; `None` only for an
/// empty ladder.
pub fn get_optimal_rung(ladder: &[BitrateLadderRung], available_kbps: u32) -> Option<&BitrateLadderRung> {
    let budget = f64::from(available_kbps) * BANDWIDTH_HEADROOM;
    ladder
        .iter()
        .take_while(|r| f64::from(r.total_bitrate()) <= budget)
        .last()
        .or_else(|| ladder.first())
}

// ---------------------------------------------------------------------------
// Storage estimate
// ---------------------------------------------------------------------------

/// Estimated output size of one rung.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RungStorage {
    pub label: String,
    pub size_mb: f64,
}

/// Estimated output size of an entire ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageEstimate {
    pub duration_secs: f64,
    pub rungs: Vec<RungStorage>,
    pub total_size_mb: f64,
}

impl StorageEstimate {
    pub fn total_size_gb(&self) -> f64 {
        self.total_size_mb / 1024.0
    }
}

/// Disk space needed to store every rung of `ladder` for `duration_secs`.
pub fn storage_requirements(ladder: &[BitrateLadderRung], duration_secs: f64) -> StorageEstimate {
    let rungs: Vec<RungStorage> = ladder
        .iter()
        .map(|r| RungStorage {
            label: r.label.clone(),
            // kbps * seconds / 8 = kilobytes; / 1024 = megabytes.
            size_mb: f64::from(r.total_bitrate()) * duration_secs / (8.0 * 1024.0),
        })
        .collect();
    let total_size_mb = rungs.iter().map(|r| r.size_mb).sum();
    StorageEstimate {
        duration_secs,
        rungs,
        total_size_mb,
    }
}

// ---------------------------------------------------------------------------
// Codec strings & per-title tuning
// ---------------------------------------------------------------------------

/// RFC 6381 `avc1` codec string, e.g. `avc1.64E029` for high@4.1.
pub fn avc_codec_string(profile: H264Profile, level: &str) -> Option<String> {
    let level_hex = match level {
        "3.0" | "3" => "1E",
        "3.1" => "1F",
        "4.0" | "4" => "28",
        "4.1" => "29",
        "5.0" | "5" => "32",
        "5.1" => "33",
        _ => return None,
    };
    Some(format!("avc1.{}E0{}", profile.idc_hex(), level_hex))
}

/// Broad content classification used for per-title bitrate tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Animation,
    Sports,
    Film,
    Other,
}

/// Bitrate multiplier for a title. `complexity` (0..=1) only matters for
/// [`ContentType::Other`]; an unknown complexity (0 or less) leaves the
/// ladder unscaled.
pub fn per_title_multiplier(content: ContentType, complexity: f64) -> f64 {
    match content {
        ContentType::Animation => 0.7,
        ContentType::Sports => 1.3,
        ContentType::Film => 1.1,
        ContentType::Other if complexity > 0.0 => 0.8 + complexity.min(1.0) * 0.4,
        ContentType::Other => 1.0,
    }
}

/// Scale every video bitrate in `ladder` for the given title.
pub fn apply_per_title(ladder: &mut [BitrateLadderRung], content: ContentType, complexity: f64) {
    let multiplier = per_title_multiplier(content, complexity);
    for rung in ladder {
        rung.video_bitrate = (f64::from(rung.video_bitrate) * multiplier) as u32;
    }
}
