//! Built-in ffmpeg provider.
//!
//! Each session is one ffmpeg process spawned in its own process group and
//! registered with the [`ProcessSupervisor`]. Progress comes from
//! `-progress pipe:1`; the last lines of stderr are kept for error messages.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use pf_core::{
    normalize_audio_codec, normalize_container, normalize_video_codec, Error, Resolution, Result,
    SessionId, SpeedPriority,
};
use pf_playback::ladder::generate_ladder;

use crate::hardware::{HardwareSupport, HwAccel};
use crate::output::OutputLayout;
use crate::process::ProcessSupervisor;
use crate::provider::TranscodingProvider;
use crate::types::{
    ContainerFormat, ProviderCapabilities, ProviderInfo, TranscodeHandle, TranscodeRequest,
    TranscodeStatus, TranscodingProgress,
};

pub const PROVIDER_ID: &str = "ffmpeg";

/// Lines of stderr kept per session.
const STDERR_TAIL: usize = 20;

/// Resolution assumed for ladders when the request does not carry one.
const DEFAULT_LADDER_SOURCE: Resolution = Resolution::new(1920, 1080);

const HLS_SEGMENT_SECS: &str = "4";

const SOFTWARE_H264_ENCODER: &str = "libx264";

/// How long a finished job's final state stays queryable.
const JOB_RETENTION: Duration = Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// Argument building
// ---------------------------------------------------------------------------

/// Map 0..=100 quality onto CRF 35..=18.
pub fn crf_for_quality(quality: u8) -> u8 {
    let crf = 35 - (u32::from(quality.min(100)) * 17 / 100);
    crf.clamp(18, 35) as u8
}

fn preset(priority: SpeedPriority) -> &'static str {
    match priority {
        SpeedPriority::Fastest => "ultrafast",
        SpeedPriority::Balanced => "veryfast",
        SpeedPriority::Quality => "medium",
    }
}

/// Encoder for the requested codec. `None` means stream copy.
fn video_encoder(codec: Option<&str>, h264_encoder: &'static str) -> Option<String> {
    let codec = codec.map(normalize_video_codec);
    match codec.as_deref() {
        None | Some("h264") => Some(h264_encoder.to_string()),
        Some("copy") => None,
        Some("hevc") => Some("libx265".into()),
        Some("av1") => Some("libsvtav1".into()),
        Some("vp9") => Some("libvpx-vp9".into()),
        Some(other) => Some(other.to_string()),
    }
}

fn audio_encoder(codec: Option<&str>) -> String {
    match codec.map(normalize_audio_codec).as_deref() {
        None => "aac".into(),
        Some("opus") => "libopus".into(),
        Some("vorbis") => "libvorbis".into(),
        Some("mp3") => "libmp3lame".into(),
        Some(other) => other.to_string(),
    }
}

/// Primary output file for a container, relative to the session directory.
pub fn output_file_name(container: &str, abr: bool) -> String {
    match normalize_container(container).as_str() {
        "hls" if abr => "%v/playlist.m3u8".into(),
        "hls" => "playlist.m3u8".into(),
        "dash" => "manifest.mpd".into(),
        other => format!("output.{other}"),
    }
}

/// Build the full ffmpeg argument list for `request`, writing into `dir`.
///
/// With `hw` set, H.264 goes through that backend's encoder, which is driven
/// by bitrate rather than CRF.
pub fn build_args(request: &TranscodeRequest, dir: &Path, hw: Option<HwAccel>) -> Vec<String> {
    let container = normalize_container(&request.container);
    let abr = request.enable_abr && container == "hls";
    let hw_args: &[&str] = hw.map_or(&[], |h| h.hwaccel_args());
    let h264_encoder = hw.map_or(SOFTWARE_H264_ENCODER, |h| h.h264_encoder());
    let use_crf = hw.is_none();

    let mut args: Vec<String> = ["-hide_banner", "-y", "-nostdin", "-progress", "pipe:1", "-nostats"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(hw_args.iter().map(|s| s.to_string()));

    if let Some(seek) = request.seek.filter(|s| *s > 0.0) {
        args.extend(["-ss".into(), format!("{seek:.3}")]);
    }
    args.extend(["-i".into(), request.input_path.to_string_lossy().into_owned()]);

    if abr {
        push_abr_args(&mut args, request, h264_encoder, dir);
        return args;
    }

    args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(String::from));

    match video_encoder(request.video_codec.as_deref(), h264_encoder) {
        None => args.extend(["-c:v", "copy"].map(String::from)),
        Some(encoder) => {
            let software = use_crf || encoder != h264_encoder;
            args.extend(["-c:v".to_string(), encoder.clone()]);
            if encoder.starts_with("libx26") {
                args.extend(["-preset".into(), preset(request.speed_priority).into()]);
            }
            if software {
                args.extend(["-crf".into(), crf_for_quality(request.quality).to_string()]);
                if encoder == "libvpx-vp9" {
                    args.extend(["-b:v", "0", "-row-mt", "1"].map(String::from));
                }
                if let Some(kbps) = request.video_bitrate {
                    args.extend([
                        "-maxrate".into(),
                        format!("{kbps}k"),
                        "-bufsize".into(),
                        format!("{}k", kbps * 2),
                    ]);
                }
            } else {
                let kbps = request.video_bitrate.unwrap_or(5000);
                args.extend([
                    "-b:v".into(),
                    format!("{kbps}k"),
                    "-maxrate".into(),
                    format!("{}k", kbps * 3 / 2),
                    "-bufsize".into(),
                    format!("{}k", kbps * 2),
                ]);
            }

            let mut filters = Vec::new();
            if let Some(Resolution { width, height }) = request.resolution {
                filters.push(format!("scale={width}:{height}:flags=lanczos"));
            }
            if software {
                filters.push("format=yuv420p".into());
            }
            if !filters.is_empty() {
                args.extend(["-vf".into(), filters.join(",")]);
            }
            args.extend(["-force_key_frames", "expr:gte(t,n_forced*2)"].map(String::from));
        }
    }

    let audio = audio_encoder(request.audio_codec.as_deref());
    if audio == "copy" {
        args.extend(["-c:a", "copy"].map(String::from));
    } else {
        args.extend([
            "-c:a".into(),
            audio,
            "-b:a".into(),
            format!("{}k", request.audio_bitrate.unwrap_or(128)),
            "-ac".into(),
            "2".into(),
        ]);
    }

    match container.as_str() {
        "hls" => args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            HLS_SEGMENT_SECS.into(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_segment_type".into(),
            "fmp4".into(),
            "-hls_fmp4_init_filename".into(),
            "init.mp4".into(),
            "-hls_segment_filename".into(),
            dir.join("segment_%03d.m4s").to_string_lossy().into_owned(),
        ]),
        "dash" => args.extend(
            ["-f", "dash", "-seg_duration", HLS_SEGMENT_SECS, "-use_template", "1", "-use_timeline", "1"]
                .map(String::from),
        ),
        "mp4" | "mov" => args.extend(["-f", "mp4", "-movflags", "+faststart"].map(String::from)),
        "webm" => args.extend(["-f", "webm"].map(String::from)),
        "mkv" => args.extend(["-f", "matroska"].map(String::from)),
        _ => {}
    }

    let output = request
        .output_path
        .clone()
        .unwrap_or_else(|| dir.join(output_file_name(&container, false)));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// One HLS variant per ladder rung, tied together by a master playlist.
fn push_abr_args(args: &mut Vec<String>, request: &TranscodeRequest, encoder: &str, dir: &Path) {
    let source = request.resolution.unwrap_or(DEFAULT_LADDER_SOURCE);
    let ladder = generate_ladder(source.width, source.height, request.quality);

    for _ in &ladder {
        args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(String::from));
    }
    for (i, rung) in ladder.iter().enumerate() {
        args.extend([
            format!("-c:v:{i}"),
            encoder.to_string(),
            format!("-b:v:{i}"),
            format!("{}k", rung.video_bitrate),
            format!("-maxrate:v:{i}"),
            format!("{}k", rung.video_bitrate * 3 / 2),
            format!("-bufsize:v:{i}"),
            format!("{}k", rung.video_bitrate * 2),
            format!("-filter:v:{i}"),
            format!("scale={}:{},format=yuv420p", rung.width, rung.height),
            format!("-profile:v:{i}"),
            rung.profile.as_str().to_string(),
            format!("-c:a:{i}"),
            "aac".into(),
            format!("-b:a:{i}"),
            format!("{}k", rung.audio_bitrate),
        ]);
    }
    let stream_map = ladder
        .iter()
        .enumerate()
        .map(|(i, rung)| format!("v:{i},a:{i},name:{}", rung.label))
        .collect::<Vec<_>>()
        .join(" ");

    args.extend([
        "-preset".into(),
        preset(request.speed_priority).into(),
        "-force_key_frames".into(),
        "expr:gte(t,n_forced*2)".into(),
        "-var_stream_map".into(),
        stream_map,
        "-master_pl_name".into(),
        "master.m3u8".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        HLS_SEGMENT_SECS.into(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_segment_filename".into(),
        dir.join("%v/segment_%03d.ts").to_string_lossy().into_owned(),
        dir.join(output_file_name("hls", true)).to_string_lossy().into_owned(),
    ]);
}

// ---------------------------------------------------------------------------
// Progress parsing
// ---------------------------------------------------------------------------

/// One `-progress` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub out_time_secs: f64,
    pub fps: Option<f64>,
    pub speed: Option<f64>,
    pub frame: u64,
    pub total_size: u64,
    /// `progress=end` was seen.
    pub finished: bool,
}

/// Accumulates `key=value` lines until `progress=...` closes a block.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSnapshot,
}

impl ProgressParser {
    pub fn feed(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            "out_time_us" | "out_time_ms" => {
                // ffmpeg reports microseconds under both keys.
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time_secs = us.max(0) as f64 / 1_000_000.0;
                }
            }
            "fps" => self.current.fps = value.parse().ok(),
            "speed" => {
                self.current.speed = value.trim_end_matches('x').trim().parse().ok();
            }
            "frame" => self.current.frame = value.parse().unwrap_or(self.current.frame),
            "total_size" => self.current.total_size = value.parse().unwrap_or(self.current.total_size),
            "progress" => {
                self.current.finished = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Retry delay suggested when the host cannot fork another encoder.
const SPAWN_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Classify a failed spawn. A binary that vanished after discovery makes the
/// provider unavailable; a host out of processes or memory is exhausted.
fn spawn_error(e: std::io::Error, session_id: SessionId) -> Error {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            Error::provider_unavailable(PROVIDER_ID, format!("cannot run ffmpeg: {e}"))
                .with_session(session_id)
        }
        ErrorKind::WouldBlock | ErrorKind::OutOfMemory => Error::ResourceExhausted {
            message: format!("cannot spawn ffmpeg: {e}"),
            retry_after: SPAWN_RETRY_AFTER,
        }
        .with_session(session_id),
        _ => Error::transcode(PROVIDER_ID, session_id, format!("failed to spawn ffmpeg: {e}")),
    }
}

struct JobState {
    status: TranscodeStatus,
    last: ProgressSnapshot,
    stderr_tail: VecDeque<String>,
    error: Option<String>,
    finished_at: Option<Instant>,
}

struct Job {
    pid: i32,
    started: Instant,
    /// Seconds of media to encode, when known.
    duration: Option<f64>,
    stopping: CancellationToken,
    state: Mutex<JobState>,
}

impl Job {
    fn progress(&self, session_id: SessionId) -> TranscodingProgress {
        let state = self.state.lock();
        let percent = match (state.status, self.duration) {
            (TranscodeStatus::Completed, _) => 100.0,
            (_, Some(d)) if d > 0.0 => (state.last.out_time_secs / d * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        };
        TranscodingProgress {
            session_id,
            status: state.status,
            percent,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            speed: state.last.speed,
            frame: state.last.frame,
            bytes_written: state.last.total_size,
            error: state.error.clone(),
        }
    }
}

pub struct FfmpegProvider {
    ffmpeg: PathBuf,
    layout: OutputLayout,
    supervisor: Arc<ProcessSupervisor>,
    hardware: HardwareSupport,
    jobs: DashMap<SessionId, Arc<Job>>,
}

impl FfmpegProvider {
    /// Software encoding only. See [`FfmpegProvider::detect`].
    pub fn new(ffmpeg: PathBuf, layout: OutputLayout, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            ffmpeg,
            layout,
            supervisor,
            hardware: HardwareSupport::none(),
            jobs: DashMap::new(),
        }
    }

    /// Build the provider with whatever hardware encoders this host offers.
    pub async fn detect(ffmpeg: PathBuf, layout: OutputLayout, supervisor: Arc<ProcessSupervisor>) -> Self {
        let hardware = HardwareSupport::detect(&ffmpeg).await;
        Self::new(ffmpeg, layout, supervisor).with_hardware(hardware)
    }

    pub fn with_hardware(mut self, hardware: HardwareSupport) -> Self {
        self.hardware = hardware;
        self
    }

    fn job(&self, session_id: SessionId) -> Result<Arc<Job>> {
        self.jobs
            .get(&session_id)
            .map(|j| Arc::clone(j.value()))
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    /// Drop jobs that finished more than [`JOB_RETENTION`] ago.
    fn prune_finished(&self) {
        self.jobs.retain(|_, job| {
            job.state
                .lock()
                .finished_at
                .map_or(true, |at| at.elapsed() < JOB_RETENTION)
        });
    }
}

#[async_trait]
impl TranscodingProvider for FfmpegProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: PROVIDER_ID.into(),
            name: "FFmpeg".into(),
            description: "Software and hardware-assisted encoding through the ffmpeg CLI".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            author: "playforged".into(),
            priority: 50,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            formats: vec![
                ContainerFormat::new("mp4", "video/mp4", &["mp4", "m4v"], false),
                ContainerFormat::new("webm", "video/webm", &["webm"], false),
                ContainerFormat::new("mkv", "video/x-matroska", &["mkv"], false),
                ContainerFormat::new("hls", "application/vnd.apple.mpegurl", &["m3u8"], true),
                ContainerFormat::new("dash", "application/dash+xml", &["mpd"], true),
            ],
            supports_streaming: false,
            supports_abr: true,
            hardware_acceleration: self.hardware.names(),
        }
    }

    async fn start_transcode(&self, request: &TranscodeRequest) -> Result<TranscodeHandle> {
        let session_id = request
            .session_id
            .ok_or_else(|| Error::Validation("request has no session ID".into()))?;
        self.prune_finished();
        let dir = self
            .layout
            .prepare_session_dir(&request.container, PROVIDER_ID, session_id)
            .await?;
        let hw = self.hardware.select(request);
        let args = build_args(request, &dir, hw);

        tracing::info!(
            session_id = %session_id,
            input = %request.input_path.display(),
            container = %request.container,
            hw_accel = hw.map_or("none", |h| h.as_str()),
            "Starting ffmpeg"
        );
        tracing::debug!(session_id = %session_id, args = ?args, "ffmpeg arguments");

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_error(e, session_id))?;
        let pid = child
            .id()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| Error::transcode(PROVIDER_ID, session_id, "ffmpeg exited immediately"))?;

        if let Err(e) = self.supervisor.register(pid, session_id, PROVIDER_ID) {
            let _ = child.start_kill();
            return Err(e);
        }

        let job = Arc::new(Job {
            pid,
            started: Instant::now(),
            duration: request
                .duration
                .map(|d| d - request.seek.unwrap_or(0.0))
                .filter(|d| *d > 0.0),
            stopping: CancellationToken::new(),
            state: Mutex::new(JobState {
                status: TranscodeStatus::Running,
                last: ProgressSnapshot::default(),
                stderr_tail: VecDeque::with_capacity(STDERR_TAIL),
                error: None,
                finished_at: None,
            }),
        });

        let stdout_task = child.stdout.take().map(|stdout| {
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                let mut parser = ProgressParser::default();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(snapshot) = parser.feed(&line) {
                        job.state.lock().last = snapshot;
                    }
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut state = job.state.lock();
                    if state.stderr_tail.len() == STDERR_TAIL {
                        state.stderr_tail.pop_front();
                    }
                    state.stderr_tail.push_back(line);
                }
            })
        });

        {
            let job = Arc::clone(&job);
            let supervisor = Arc::clone(&self.supervisor);
            tokio::spawn(async move {
                let exit = child.wait().await;
                // Drain both pipes so the final state sees every line.
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    let _ = task.await;
                }
                supervisor.unregister(job.pid);

                let mut state = job.state.lock();
                state.status = match exit {
                    _ if job.stopping.is_cancelled() => TranscodeStatus::Cancelled,
                    Ok(status) if status.success() => TranscodeStatus::Completed,
                    Ok(status) => {
                        let tail: Vec<&str> = state.stderr_tail.iter().map(String::as_str).collect();
                        state.error = Some(format!("ffmpeg exited with {status}: {}", tail.join("\n")));
                        TranscodeStatus::Failed
                    }
                    Err(e) => {
                        state.error = Some(format!("failed to wait for ffmpeg: {e}"));
                        TranscodeStatus::Failed
                    }
                };
                state.finished_at = Some(Instant::now());
                tracing::info!(
                    session_id = %session_id,
                    pid = job.pid,
                    status = %state.status,
                    "ffmpeg finished"
                );
            });
        }

        self.jobs.insert(session_id, job);

        Ok(TranscodeHandle {
            session_id,
            provider: PROVIDER_ID.into(),
            status: TranscodeStatus::Running,
            started_at: chrono::Utc::now(),
            directory: dir,
        })
    }

    async fn progress(&self, session_id: SessionId) -> Result<TranscodingProgress> {
        Ok(self.job(session_id)?.progress(session_id))
    }

    async fn stop_transcode(&self, session_id: SessionId) -> Result<()> {
        let job = self.job(session_id)?;
        job.stopping.cancel();
        self.supervisor
            .kill_process_group(job.pid)
            .await
            .map_err(|e| e.with_session(session_id))?;

        let mut state = job.state.lock();
        if !state.status.is_terminal() {
            state.status = TranscodeStatus::Cancelled;
        }
        Ok(())
    }
}
