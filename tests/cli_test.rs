//! CLI end-to-end tests
//!
//! Commands that need no external tools: ladder, validate, version and
//! argument errors.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

/// Get a command for the playforged binary
#[allow(deprecated)]
fn playforged_cmd() -> Command {
    Command::cargo_bin("playforged").unwrap()
}

#[test]
fn no_args_shows_usage() {
    playforged_cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_prints_package_version() {
    playforged_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn ladder_table_marks_the_optimal_rung() {
    playforged_cmd()
        .args(["ladder", "--width", "1920", "--height", "1080", "--bandwidth", "3000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("480p"))
        .stdout(predicate::str::contains("1080p"))
        .stdout(predicate::str::contains("*"));
}

#[test]
fn ladder_json_includes_storage() {
    let output = playforged_cmd()
        .args([
            "ladder", "--width", "1280", "--height", "720", "--duration", "600", "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ladder = value["ladder"].as_array().unwrap();
    assert!(!ladder.is_empty());
    assert!(ladder.iter().all(|r| r["height"].as_u64().unwrap() <= 720));
    assert!(value["storage"]["total_size_mb"].as_f64().unwrap() > 0.0);
}

#[test]
fn validate_reports_warnings() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, r#"{"transcoding": {"max_concurrent_sessions": 0}}"#).unwrap();

    playforged_cmd()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("max_concurrent_sessions is 0"));
}

#[test]
fn validate_rejects_malformed_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, "{ not json").unwrap();

    playforged_cmd()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("config parse error"));
}

#[test]
fn decide_missing_file_fails() {
    playforged_cmd()
        .args(["decide", "/nonexistent/movie.mkv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn transcode_rejects_bad_resolution() {
    playforged_cmd()
        .args(["transcode", "in.mkv", "--resolution", "huge"])
        .assert()
        .failure();
}

#[test]
fn ladder_scales_bitrates_for_animation() {
    let ladder_json = |extra: &[&str]| -> serde_json::Value {
        let output = playforged_cmd()
            .args(["ladder", "--width", "1920", "--height", "1080", "--json"])
            .args(extra)
            .output()
            .unwrap();
        assert!(output.status.success());
        serde_json::from_slice(&output.stdout).unwrap()
    };

    let plain = ladder_json(&[]);
    let animation = ladder_json(&["--content", "animation"]);
    let top = |v: &serde_json::Value| v["ladder"][2]["video_bitrate"].as_u64().unwrap();
    assert!(top(&animation) < top(&plain));
}
