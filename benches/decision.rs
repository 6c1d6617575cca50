//! Benchmarks for playback decisions
//!
//! Measures classification of already-probed media for direct play, remux
//! and transcode outcomes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use playforged::core::{DeviceProfile, MediaCharacteristics};
use playforged::playback::PlaybackDecisionEngine;

fn media(container: &str, video: &str, audio: &str) -> MediaCharacteristics {
    MediaCharacteristics {
        container: container.to_string(),
        video_codec: Some(video.to_string()),
        audio_codec: Some(audio.to_string()),
        width: 3840,
        height: 2160,
        bitrate: 40_000,
        duration_secs: Some(7200.0),
    }
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");
    let engine = PlaybackDecisionEngine::default();
    let profile = DeviceProfile::default();

    let cases = [
        ("direct", media("mp4", "h264", "aac")),
        ("remux", media("matroska,webm", "avc1", "eac3")),
        ("transcode", media("mkv", "hevc", "truehd")),
    ];

    for (label, media) in &cases {
        group.bench_with_input(BenchmarkId::from_parameter(label), media, |b, media| {
            b.iter(|| {
                engine.decide(
                    black_box("/media/movie.mkv"),
                    black_box(media),
                    black_box(&profile),
                )
            });
        });
    }

    let phone = DeviceProfile {
        name: "phone".into(),
        max_height: 720,
        max_bitrate: 2500,
        ..DeviceProfile::default()
    };
    group.bench_function("transcode/constrained_device", |b| {
        b.iter(|| engine.decide("/media/movie.mkv", black_box(&cases[2].1), black_box(&phone)));
    });

    group.finish();
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
