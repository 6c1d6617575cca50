//! The ffmpeg provider driven end to end against stand-in ffmpeg scripts.

#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use common::{request, test_limits, StaticProbe, TestHarness};
use playforged::core::config::ProcessConfig;
use playforged::transcode::{FfmpegProvider, ProcessSupervisor, TranscodeStatus};

const SUCCEEDS: &str = r#"#!/bin/sh
for last; do :; done
echo "frame=120"
echo "fps=48.0"
echo "out_time_us=5000000"
echo "total_size=4"
echo "speed=2.0x"
echo "progress=continue"
printf 'data' > "$last"
echo "out_time_us=10000000"
echo "progress=end"
exit 0
"#;

const FAILS: &str = r#"#!/bin/sh
echo "Invalid data found when processing input" >&2
echo "boom" >&2
exit 1
"#;

const HANGS: &str = r#"#!/bin/sh
exec sleep 30
"#;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("ffmpeg");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Harness with a stand-in ffmpeg registered as the only provider.
fn harness(script: &str) -> (TestHarness, tempfile::TempDir) {
    let bin = tempfile::tempdir().unwrap();
    let ffmpeg = write_script(bin.path(), script);

    let process = ProcessConfig {
        graceful_kill_ms: 1000,
        forced_kill_ms: 1000,
        poll_interval_ms: 10,
        ..ProcessConfig::default()
    };
    let h = TestHarness::build(test_limits(), process, StaticProbe(None));
    let provider = FfmpegProvider::new(ffmpeg, h.layout.clone(), Arc::clone(&h.supervisor));
    h.registry.register(Arc::new(provider)).unwrap();
    (h, bin)
}

#[tokio::test]
#[serial]
async fn successful_encode_is_published() {
    let (h, _bin) = harness(SUCCEEDS);
    let cancel = CancellationToken::new();

    let mut req = request("movie", "mp4");
    req.duration = Some(10.0);
    let handle = h.service.start_transcode(&cancel, req).await.unwrap();
    assert_eq!(handle.provider, "ffmpeg");

    let record = h
        .wait_for_status(handle.session_id, TranscodeStatus::Completed)
        .await;
    let published = record.directory_path.expect("published directory");
    assert_eq!(std::fs::read(published.join("output.mp4")).unwrap(), b"data");

    assert!(record.result.expect("result").success);
    let progress = record.progress.expect("final progress");
    assert_eq!(progress.percent, 100.0);
    assert_eq!(progress.frame, 120);
    assert!(h.supervisor.is_empty());
}

#[tokio::test]
#[serial]
async fn encoder_failure_keeps_the_stderr_tail() {
    let (h, _bin) = harness(FAILS);
    let cancel = CancellationToken::new();
    let handle = h.service.start_transcode(&cancel, request("movie", "mp4")).await.unwrap();

    let record = h
        .wait_for_status(handle.session_id, TranscodeStatus::Failed)
        .await;
    let error = record.error.expect("error message");
    assert!(error.contains("boom"), "error: {error}");
    assert_eq!(h.resources.active_sessions(), 0);
}

#[tokio::test]
#[serial]
async fn stopping_kills_the_encoder() {
    let (h, _bin) = harness(HANGS);
    let cancel = CancellationToken::new();
    let handle = h.service.start_transcode(&cancel, request("movie", "mp4")).await.unwrap();

    let processes = h.supervisor.processes_for_session(handle.session_id);
    assert_eq!(processes.len(), 1);
    let pid = processes[0].pid;
    assert!(ProcessSupervisor::is_process_alive(pid));

    h.service.stop_session(handle.session_id).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while ProcessSupervisor::is_process_alive(pid) {
        assert!(tokio::time::Instant::now() < deadline, "encoder still alive");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = h.service.session(handle.session_id).await.unwrap();
    assert_eq!(record.status, TranscodeStatus::Cancelled);
    assert_eq!(h.resources.active_sessions(), 0);
}
