//! Request, handle and capability types shared by providers and the
//! orchestration layer.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use pf_core::{
    normalize_audio_codec, normalize_container, normalize_video_codec, Error, Resolution, Result,
    SessionId, SpeedPriority,
};

fn default_quality() -> u8 {
    pf_playback::DEFAULT_QUALITY
}

// ---------------------------------------------------------------------------
// TranscodeRequest
// ---------------------------------------------------------------------------

/// A request to encode one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub media_id: String,
    /// Pre-assigned session ID; generated on admission when `None`.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub input_path: PathBuf,
    /// Explicit output location; the session directory is used when `None`.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    pub container: String,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// 0..=100.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub speed_priority: SpeedPriority,
    /// Start offset in seconds.
    #[serde(default)]
    pub seek: Option<f64>,
    /// Source duration in seconds, used for progress percentages.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub enable_abr: bool,
    #[serde(default)]
    pub prefer_hardware: bool,
    #[serde(default)]
    pub hardware_type: Option<String>,
    /// Target video bitrate in kbps.
    #[serde(default)]
    pub video_bitrate: Option<u32>,
    /// Target audio bitrate in kbps.
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
}

impl TranscodeRequest {
    pub fn new(media_id: impl Into<String>, input_path: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            session_id: None,
            input_path: input_path.into(),
            output_path: None,
            container: container.into(),
            video_codec: None,
            audio_codec: None,
            resolution: None,
            quality: default_quality(),
            speed_priority: SpeedPriority::default(),
            seek: None,
            duration: None,
            enable_abr: false,
            prefer_hardware: false,
            hardware_type: None,
            video_bitrate: None,
            audio_bitrate: None,
        }
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<()> {
        if self.input_path.as_os_str().is_empty() {
            return Err(Error::Validation("input path is required".into()));
        }
        if self.container.trim().is_empty() {
            return Err(Error::Validation("container is required".into()));
        }
        if self.quality > 100 {
            return Err(Error::Validation(format!(
                "quality must be between 0 and 100, got {}",
                self.quality
            )));
        }
        if let Some(seek) = self.seek {
            if !seek.is_finite() || seek < 0.0 {
                return Err(Error::Validation(format!("invalid seek offset {seek}")));
            }
        }
        if let Some(res) = self.resolution {
            if res.width == 0 || res.height == 0 {
                return Err(Error::Validation(format!("invalid resolution {res}")));
            }
        }
        Ok(())
    }

    /// Hash identifying "the same output" for deduplication.
    ///
    /// Covers every field that changes the encoded result. Provider hints
    /// (`prefer_hardware`, `hardware_type`) and the session ID do not.
    pub fn content_key(&self) -> String {
        fn opt<T: fmt::Display>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        let fields = [
            self.input_path.to_string_lossy().into_owned(),
            self.media_id.clone(),
            normalize_container(&self.container),
            opt(self.output_path.as_ref().map(|p| p.display())),
            opt(self.video_codec.as_deref().map(normalize_video_codec)),
            opt(self.audio_codec.as_deref().map(normalize_audio_codec)),
            opt(self.resolution),
            self.quality.to_string(),
            self.speed_priority.to_string(),
            opt(self.seek),
            opt(self.duration),
            self.enable_abr.to_string(),
            opt(self.video_bitrate),
            opt(self.audio_bitrate),
        ];

        let mut hasher = Sha256::new();
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Status & handle
// ---------------------------------------------------------------------------

/// Lifecycle of a transcode session.
///
/// `Queued → Admitted → Running → {Completed | Failed | Cancelled | TimedOut}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStatus {
    Queued,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TranscodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Returned to the caller once a provider accepted the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeHandle {
    pub session_id: SessionId,
    pub provider: String,
    pub status: TranscodeStatus,
    pub started_at: DateTime<Utc>,
    /// Session output directory.
    pub directory: PathBuf,
}

/// Point-in-time progress reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingProgress {
    pub session_id: SessionId,
    pub status: TranscodeStatus,
    /// 0.0..=100.0; 0 when the duration is unknown.
    pub percent: f64,
    pub elapsed_secs: f64,
    pub speed: Option<f64>,
    pub frame: u64,
    pub bytes_written: u64,
    pub error: Option<String>,
}

impl TranscodingProgress {
    pub fn new(session_id: SessionId, status: TranscodeStatus) -> Self {
        Self {
            session_id,
            status,
            percent: 0.0,
            elapsed_secs: 0.0,
            speed: None,
            frame: 0,
            bytes_written: 0,
            error: None,
        }
    }
}

/// Final outcome recorded for a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeResult {
    pub success: bool,
    pub output_dir: PathBuf,
    pub content_hash: Option<String>,
    pub bytes_written: u64,
    pub duration_secs: f64,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider metadata
// ---------------------------------------------------------------------------

/// Identity of a provider. Higher `priority` wins selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub priority: i32,
}

/// An output format a provider can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFormat {
    pub format: String,
    pub mime_type: String,
    pub extensions: Vec<String>,
    pub description: String,
    /// Segmented output (HLS/DASH).
    pub adaptive: bool,
}

impl ContainerFormat {
    pub fn new(format: &str, mime_type: &str, extensions: &[&str], adaptive: bool) -> Self {
        Self {
            format: format.to_string(),
            mime_type: mime_type.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            description: String::new(),
            adaptive,
        }
    }
}

/// Capabilities declared at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub formats: Vec<ContainerFormat>,
    pub supports_streaming: bool,
    pub supports_abr: bool,
    pub hardware_acceleration: Vec<String>,
}

impl ProviderCapabilities {
    /// Case-insensitive container match, after normalization.
    pub fn supports_container(&self, container: &str) -> bool {
        let wanted = normalize_container(container);
        self.formats
            .iter()
            .any(|f| normalize_container(&f.format) == wanted)
    }
}

/// A live stream opened by a streaming-capable provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub id: String,
    pub session_id: SessionId,
    pub provider: String,
    pub url: String,
}
