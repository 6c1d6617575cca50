//! Playback decision engine.
//!
//! Classifies a (media, device) pair into one of three delivery methods:
//!
//! - **Direct**: the original file is served unmodified.
//! - **Remux**: compatible streams are repackaged into a web container.
//! - **Transcode**: at least one stream must be re-encoded; the encode
//!   target is picked from the ABR ladder for the device's bandwidth.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pf_core::{
    normalize_audio_codec, normalize_container, normalize_video_codec, DeviceProfile,
    MediaCharacteristics, Result, DIRECT_PLAY_AUDIO_CODECS, DIRECT_PLAY_CONTAINERS,
    REMUX_AUDIO_CODECS,
};

use crate::ladder::{generate_ladder, get_optimal_rung, H264Profile};
use crate::probe::MediaProbe;

/// Quality used when the engine is built with [`Default`].
pub const DEFAULT_QUALITY: u8 = 80;

/// Container used when the device does not name a usable preference.
const FALLBACK_TARGET_CONTAINER: &str = "mp4";

/// Stream codec value meaning "copy without re-encoding".
pub const COPY_CODEC: &str = "copy";

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// How a media file reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMethod {
    Direct,
    Remux,
    Transcode,
}

impl fmt::Display for PlaybackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Remux => write!(f, "remux"),
            Self::Transcode => write!(f, "transcode"),
        }
    }
}

/// Output parameters for a remux or transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeParams {
    pub container: String,
    /// Target video codec, or [`COPY_CODEC`].
    pub video_codec: String,
    /// Target audio codec, or [`COPY_CODEC`].
    pub audio_codec: String,
    pub width: u32,
    pub height: u32,
    /// kbps; `None` when streams are copied.
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
    pub crf: Option<u8>,
    pub h264_profile: Option<H264Profile>,
    pub level: Option<String>,
    /// RFC 6381 codec string for manifests.
    pub codec_string: Option<String>,
    /// Ladder rung the parameters came from.
    pub rung: Option<String>,
}

/// Outcome of a playback decision. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackDecision {
    pub method: PlaybackMethod,
    pub direct_play_url: Option<String>,
    pub transcode_params: Option<TranscodeParams>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless decision engine; the quality only shapes transcode targets.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackDecisionEngine {
    quality: u8,
}

impl Default for PlaybackDecisionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl PlaybackDecisionEngine {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100),
        }
    }

    /// Classify already-probed media for `profile`.
    ///
    /// `media_path` becomes the direct-play URL.
    pub fn decide(
        &self,
        media_path: &str,
        media: &MediaCharacteristics,
        profile: &DeviceProfile,
    ) -> PlaybackDecision {
        let container = normalize_container(&media.container);
        let video = media.video_codec.as_deref().map(normalize_video_codec);
        let audio = media.audio_codec.as_deref().map(normalize_audio_codec);

        let web_container = DIRECT_PLAY_CONTAINERS.contains(&container.as_str());
        let video_ok = video.as_deref() == Some("h264");
        let audio_direct = audio
            .as_deref()
            .is_some_and(|a| DIRECT_PLAY_AUDIO_CODECS.contains(&a));
        let audio_remux = audio
            .as_deref()
            .is_some_and(|a| REMUX_AUDIO_CODECS.contains(&a));

        let decision = if web_container && video_ok && audio_direct {
            PlaybackDecision {
                method: PlaybackMethod::Direct,
                direct_play_url: Some(media_path.to_string()),
                transcode_params: None,
                reason: "File is fully compatible with device".into(),
            }
        } else if !web_container && video_ok && audio_remux {
            PlaybackDecision {
                method: PlaybackMethod::Remux,
                direct_play_url: None,
                transcode_params: Some(remux_params(media, profile)),
                reason: format!(
                    "Remux required: container '{container}' not supported, streams are compatible"
                ),
            }
        } else {
            let reason = match (&video, &audio) {
                (None, _) => "Transcoding required: no video stream".to_string(),
                (Some(v), _) if v != "h264" => {
                    format!("Transcoding required: video codec '{v}' not supported")
                }
                (_, Some(a)) => format!("Transcoding required: audio codec '{a}' not supported"),
                (_, None) => "Transcoding required: no audio stream".to_string(),
            };
            PlaybackDecision {
                method: PlaybackMethod::Transcode,
                direct_play_url: None,
                transcode_params: Some(self.transcode_params(media, profile)),
                reason,
            }
        };

        tracing::debug!(
            media_path,
            container = %container,
            video = ?video,
            audio = ?audio,
            method = %decision.method,
            "Playback decision"
        );
        decision
    }

    /// Probe `media_path` and classify it. Probe failures are returned as-is.
    pub async fn decide_playback(
        &self,
        probe: &dyn MediaProbe,
        media_path: &Path,
        profile: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        let media = probe.probe(media_path).await?;
        Ok(self.decide(&media_path.to_string_lossy(), &media, profile))
    }

    fn transcode_params(&self, media: &MediaCharacteristics, profile: &DeviceProfile) -> TranscodeParams {
        let source_height = if media.height == 0 {
            profile.max_height
        } else {
            media.height
        };
        let full = generate_ladder(media.width, source_height, self.quality);
        let fitting: Vec<_> = full
            .iter()
            .filter(|r| r.height <= profile.max_height)
            .cloned()
            .collect();
        let candidates = if fitting.is_empty() { &full[..1] } else { &fitting[..] };

        let rung = get_optimal_rung(candidates, profile.max_bitrate);

        TranscodeParams {
            container: target_container(profile),
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            width: rung.map_or(media.width, |r| r.width),
            height: rung.map_or(source_height, |r| r.height),
            video_bitrate: rung.map(|r| r.video_bitrate),
            audio_bitrate: rung.map(|r| r.audio_bitrate),
            crf: rung.map(|r| r.crf),
            h264_profile: rung.map(|r| r.profile),
            level: rung.map(|r| r.level.clone()),
            codec_string: rung.and_then(|r| r.codec_string()),
            rung: rung.map(|r| r.label.clone()),
        }
    }
}

fn remux_params(media: &MediaCharacteristics, profile: &DeviceProfile) -> TranscodeParams {
    TranscodeParams {
        container: target_container(profile),
        video_codec: COPY_CODEC.into(),
        audio_codec: COPY_CODEC.into(),
        width: media.width,
        height: media.height,
        video_bitrate: None,
        audio_bitrate: None,
        crf: None,
        h264_profile: None,
        level: None,
        codec_string: None,
        rung: None,
    }
}

/// The device's preferred container when it is web-playable, else mp4.
fn target_container(profile: &DeviceProfile) -> String {
    profile
        .preferred_container
        .as_deref()
        .map(normalize_container)
        .filter(|c| DIRECT_PLAY_CONTAINERS.contains(&c.as_str()))
        .unwrap_or_else(|| FALLBACK_TARGET_CONTAINER.to_string())
}

/// Classify with the default engine.
pub fn decide(
    media_path: &str,
    media: &MediaCharacteristics,
    profile: &DeviceProfile,
) -> PlaybackDecision {
    PlaybackDecisionEngine::default().decide(media_path, media, profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(container: &str, video: Option<&str>, audio: Option<&str>) -> MediaCharacteristics {
        MediaCharacteristics {
            container: container.into(),
            video_codec: video.map(Into::into),
            audio_codec: audio.map(Into::into),
            width: 1920,
            height: 1080,
            bitrate: 8000,
            duration_secs: Some(5400.0),
        }
    }

    fn method(container: &str, video: Option<&str>, audio: Option<&str>) -> PlaybackMethod {
        decide("/m/file", &media(container, video, audio), &DeviceProfile::default()).method
    }

    #[test]
    fn direct_for_every_web_container_and_audio() {
        for container in ["mp4", "webm", "mov", "MP4"] {
            for audio in ["aac", "mp3", "AAC"] {
                assert_eq!(
                    method(container, Some("h264"), Some(audio)),
                    PlaybackMethod::Direct,
                    "{container}/{audio}"
                );
            }
        }
    }

    #[test]
    fn direct_carries_url_and_reason() {
        let d = decide("/movies/a.mp4", &media("mp4", Some("h264"), Some("aac")), &DeviceProfile::default());
        assert_eq!(d.direct_play_url.as_deref(), Some("/movies/a.mp4"));
        assert!(d.transcode_params.is_none());
        assert_eq!(d.reason, "File is fully compatible with device");
    }

    #[test]
    fn remux_for_other_containers() {
        for container in ["mkv", "avi", "ts", "Matroska"] {
            for audio in ["aac", "mp3", "ac3", "eac3", "E-AC-3"] {
                assert_eq!(
                    method(container, Some("h264"), Some(audio)),
                    PlaybackMethod::Remux,
                    "{container}/{audio}"
                );
            }
        }
    }

    #[test]
    fn remux_params_copy_streams() {
        let d = decide("/m/a.mkv", &media("mkv", Some("avc"), Some("ac3")), &DeviceProfile::default());
        let params = d.transcode_params.unwrap();
        assert_eq!(params.container, "mp4");
        assert_eq!(params.video_codec, COPY_CODEC);
        assert_eq!(params.audio_codec, COPY_CODEC);
        assert_eq!((params.width, params.height), (1920, 1080));
    }

    #[test]
    fn transcode_for_incompatible_video() {
        for video in ["hevc", "h265", "vp9", "av1", "mpeg2video"] {
            for container in ["mp4", "mkv"] {
                let d = decide("/m/f", &media(container, Some(video), Some("aac")), &DeviceProfile::default());
                assert_eq!(d.method, PlaybackMethod::Transcode, "{container}/{video}");
                assert!(d.reason.contains("video codec"), "{}", d.reason);
            }
        }
    }

    #[test]
    fn transcode_for_incompatible_audio() {
        // ac3 is remuxable but not direct-playable, so a web container forces a transcode.
        assert_eq!(method("mp4", Some("h264"), Some("ac3")), PlaybackMethod::Transcode);
        assert_eq!(method("mkv", Some("h264"), Some("dts")), PlaybackMethod::Transcode);
        assert_eq!(method("mkv", Some("h264"), Some("truehd")), PlaybackMethod::Transcode);
        let d = decide("/m/f", &media("mkv", Some("h264"), Some("flac")), &DeviceProfile::default());
        assert_eq!(d.reason, "Transcoding required: audio codec 'flac' not supported");
    }

    #[test]
    fn missing_streams() {
        for container in ["mp4", "webm", "mkv", "mov"] {
            let d = decide("/m/f", &media(container, Some("h264"), None), &DeviceProfile::default());
            assert_eq!(d.method, PlaybackMethod::Transcode, "{container}");
            assert_eq!(d.reason, "Transcoding required: no audio stream");
        }
        let d = decide("/m/f", &media("mp4", None, Some("aac")), &DeviceProfile::default());
        assert_eq!(d.method, PlaybackMethod::Transcode);
        assert_eq!(d.reason, "Transcoding required: no video stream");
    }

    #[test]
    fn transcode_params_follow_device_limits() {
        let profile = DeviceProfile {
            max_height: 720,
            max_bitrate: 10_000,
            ..DeviceProfile::default()
        };
        let d = decide("/m/f", &media("mkv", Some("hevc"), Some("aac")), &profile);
        let params = d.transcode_params.unwrap();
        assert_eq!(params.container, "mp4");
        assert_eq!(params.video_codec, "h264");
        assert_eq!(params.audio_codec, "aac");
        assert_eq!((params.width, params.height), (1280, 720));
        assert_eq!(params.video_bitrate, Some(1500));
        assert_eq!(params.rung.as_deref(), Some("720p"));
        assert_eq!(params.codec_string.as_deref(), Some("avc1.4DE028"));
    }

    #[test]
    fn transcode_params_follow_bandwidth() {
        let profile = DeviceProfile {
            max_bitrate: 1200,
            ..DeviceProfile::default()
        };
        let d = decide("/m/f", &media("mp4", Some("vp9"), Some("opus")), &profile);
        assert_eq!(d.transcode_params.unwrap().rung.as_deref(), Some("480p"));
    }

    #[test]
    fn preferred_container_is_honoured_when_web_playable() {
        let webm = DeviceProfile {
            preferred_container: Some("WEBM".into()),
            ..DeviceProfile::default()
        };
        let d = decide("/m/f", &media("mkv", Some("h264"), Some("aac")), &webm);
        assert_eq!(d.transcode_params.unwrap().container, "webm");

        let odd = DeviceProfile {
            preferred_container: Some("mkv".into()),
            ..DeviceProfile::default()
        };
        let d = decide("/m/f", &media("mkv", Some("h264"), Some("aac")), &odd);
        assert_eq!(d.transcode_params.unwrap().container, "mp4");
    }

    #[test]
    fn engine_quality_scales_bitrate() {
        let engine = PlaybackDecisionEngine::new(40);
        let d = engine.decide("/m/f", &media("mkv", Some("hevc"), Some("aac")), &DeviceProfile::default());
        assert_eq!(d.transcode_params.unwrap().video_bitrate, Some(1400));
    }
}
