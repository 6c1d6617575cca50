//! Benchmarks for ABR ladder generation
//!
//! Covers ladder construction, bandwidth-based rung selection and the
//! ffmpeg argument builder that consumes the ladder.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use playforged::playback::{generate_ladder, get_optimal_rung, storage_requirements};
use playforged::transcode::ffmpeg::build_args;
use playforged::transcode::TranscodeRequest;
use std::path::Path;

fn bench_generate_ladder(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_ladder");

    for (label, width, height) in [
        ("480p", 854, 480),
        ("1080p", 1920, 1080),
        ("2160p", 3840, 2160),
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(label),
            &(width, height),
            |b, &(w, h)| {
                b.iter(|| generate_ladder(black_box(w), black_box(h), black_box(80)));
            },
        );
    }

    group.finish();
}

fn bench_rung_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("rung_selection");
    let ladder = generate_ladder(1920, 1080, 80);

    for kbps in [500, 3000, 20_000] {
        group.bench_with_input(BenchmarkId::new("optimal", kbps), &kbps, |b, &kbps| {
            b.iter(|| get_optimal_rung(black_box(&ladder), black_box(kbps)));
        });
    }

    group.bench_function("storage/2h", |b| {
        b.iter(|| storage_requirements(black_box(&ladder), black_box(7200.0)));
    });

    group.finish();
}

fn bench_build_args(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_args");
    let dir = Path::new("/var/lib/playforged/transcodes/session");

    let mp4 = TranscodeRequest::new("movie", "/media/movie.mkv", "mp4");
    group.bench_function("mp4", |b| {
        b.iter(|| build_args(black_box(&mp4), black_box(dir), None));
    });

    let mut abr = TranscodeRequest::new("movie", "/media/movie.mkv", "hls");
    abr.enable_abr = true;
    group.bench_function("hls_abr", |b| {
        b.iter(|| build_args(black_box(&abr), black_box(dir), None));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_generate_ladder,
    bench_rung_selection,
    bench_build_args
);
criterion_main!(benches);
