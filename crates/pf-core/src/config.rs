//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! admission, process supervision, tool, ladder, error-reporting and output
//! retention sections.
//! Every section defaults sensibly so a completely empty `{}` file is valid.
//! Durations are stored as plain integers (seconds or milliseconds, as the
//! field name says) and exposed as [`Duration`] through accessor methods.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transcoding: TranscodingConfig,
    pub process: ProcessConfig,
    pub tools: ToolsConfig,
    pub ladder: LadderConfig,
    pub errors: ErrorReportingConfig,
    pub cleanup: CleanupConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let t = &self.transcoding;

        if t.max_concurrent_sessions == 0 {
            warnings.push(
                "transcoding.max_concurrent_sessions is 0; no transcode will ever be admitted"
                    .into(),
            );
        }
        if t.queue_size == 0 {
            warnings.push(
                "transcoding.queue_size is 0; requests beyond capacity are rejected immediately"
                    .into(),
            );
        }
        if t.capacity_poll_ms == 0 {
            warnings.push("transcoding.capacity_poll_ms is 0; using 1ms".into());
        }
        if t.queue_timeout_secs > t.session_timeout_secs {
            warnings.push(format!(
                "transcoding.queue_timeout_secs ({}) exceeds session_timeout_secs ({})",
                t.queue_timeout_secs, t.session_timeout_secs
            ));
        }

        let p = &self.process;
        if p.forced_kill_ms == 0 {
            warnings.push(
                "process.forced_kill_ms is 0; SIGKILL survivors are reported immediately".into(),
            );
        }
        if p.poll_interval_ms == 0 || p.poll_interval_ms > p.graceful_kill_ms.max(1) {
            warnings.push(format!(
                "process.poll_interval_ms ({}) should be between 1 and graceful_kill_ms ({})",
                p.poll_interval_ms, p.graceful_kill_ms
            ));
        }

        if self.ladder.default_quality > 100 {
            warnings.push(format!(
                "ladder.default_quality {} is above 100 and will be clamped",
                self.ladder.default_quality
            ));
        }

        let c = &self.cleanup;
        if c.retention_hours == 0 {
            warnings.push(
                "cleanup.retention_hours is 0; finished sessions are removed on the next sweep"
                    .into(),
            );
        }
        if c.max_size_gb.is_some_and(|gb| gb <= 0.0) {
            warnings.push("cleanup.max_size_gb is not positive; all finished output will be evicted".into());
        }

        if self.errors.capacity == 0 {
            warnings.push("errors.capacity is 0; background errors will only be logged".into());
        }

        for (name, path) in [
            ("ffmpeg_path", &self.tools.ffmpeg_path),
            ("ffprobe_path", &self.tools.ffprobe_path),
        ] {
            if let Some(p) = path {
                if !p.exists() {
                    warnings.push(format!(
                        "tools.{name} {} does not exist; falling back to PATH",
                        p.display()
                    ));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Admission control and session tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    pub max_concurrent_sessions: usize,
    /// Hard ceiling on a tracked session's lifetime.
    pub session_timeout_secs: u64,
    /// Bounded queue length for requests waiting on capacity.
    pub queue_size: usize,
    /// How long a queued caller waits before giving up.
    pub queue_timeout_secs: u64,
    pub capacity_poll_ms: u64,
    pub monitor_interval_secs: u64,
    /// How often provider progress is polled for a running session.
    pub progress_interval_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            session_timeout_secs: 2 * 60 * 60,
            queue_size: 20,
            queue_timeout_secs: 10 * 60,
            capacity_poll_ms: 1000,
            monitor_interval_secs: 30,
            progress_interval_secs: 5,
            output_dir: std::env::temp_dir().join("playforged").join("transcodes"),
        }
    }
}

impl TranscodingConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn capacity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_poll_ms.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}

/// Encoder process supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Window between SIGTERM and SIGKILL.
    pub graceful_kill_ms: u64,
    /// Window after SIGKILL before the process is declared unkillable.
    pub forced_kill_ms: u64,
    pub poll_interval_ms: u64,
    /// Processes older than this are force-killed by the orphan sweep.
    pub max_runtime_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            graceful_kill_ms: 5000,
            forced_kill_ms: 2000,
            poll_interval_ms: 100,
            max_runtime_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl ProcessConfig {
    pub fn graceful_kill(&self) -> Duration {
        Duration::from_millis(self.graceful_kill_ms)
    }

    pub fn forced_kill(&self) -> Duration {
        Duration::from_millis(self.forced_kill_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// ABR ladder defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderConfig {
    /// Quality setting (0..=100) used when a request does not specify one.
    pub default_quality: u8,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self { default_quality: 80 }
    }
}

/// In-memory error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorReportingConfig {
    /// Maximum retained reports; the oldest are dropped first.
    pub capacity: usize,
}

impl Default for ErrorReportingConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Retention of finished sessions and their output directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Finished sessions older than this are removed with their output.
    pub retention_hours: u64,
    /// Cap on the output directory's total size. `None` means unlimited.
    pub max_size_gb: Option<f64>,
    /// Unowned directories younger than this are left alone.
    pub orphan_grace_secs: u64,
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            max_size_gb: None,
            orphan_grace_secs: 30 * 60,
            interval_secs: 10 * 60,
        }
    }
}

impl CleanupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 60 * 60)
    }

    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_gb
            .map(|gb| (gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
