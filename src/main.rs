mod cli;

use playforged::app::App;
use playforged::core::config::Config;
use playforged::core::tools::ToolRegistry;
use playforged::core::{DeviceProfile, Resolution};
use playforged::playback::{
    apply_per_title, generate_ladder, get_optimal_rung, storage_requirements, BitrateLadderRung,
    FfprobeProber, MediaProbe, PlaybackDecisionEngine, PlaybackMethod,
};
use playforged::transcode::{TranscodeRequest, TranscodeStatus};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for the `transcode` command.
struct TranscodeOptions {
    container: String,
    resolution: Option<Resolution>,
    quality: Option<u8>,
    seek: Option<f64>,
    hw_accel: Option<String>,
    abr: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "playforged=trace,pf_transcode=trace,pf_playback=debug,pf_core=debug".to_string()
        } else {
            "playforged=info,pf_transcode=info,pf_playback=info,pf_core=info".to_string()
        }
    });

    // Logs go to stderr so `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone();
    match cli.command {
        Commands::Decide {
            file,
            profile,
            json,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(decide(&file, profile.as_deref(), config_path.as_deref(), json))
        }
        Commands::Ladder {
            width,
            height,
            quality,
            bandwidth,
            duration,
            content,
            complexity,
            json,
        } => {
            let quality = quality
                .unwrap_or_else(|| Config::load_or_default(config_path.as_deref()).ladder.default_quality);
            let mut ladder = generate_ladder(width, height, quality);
            if let Some(content) = content {
                apply_per_title(&mut ladder, content.into(), complexity);
            }
            print_ladder(&ladder, (width, height, quality), bandwidth, duration, json)
        }
        Commands::Transcode {
            input,
            container,
            resolution,
            quality,
            seek,
            hw_accel,
            abr,
        } => {
            let options = TranscodeOptions {
                container,
                resolution,
                quality,
                seek,
                hw_accel,
                abr,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(transcode(input, config_path.as_deref(), options))
        }
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(config_path.as_deref()))
        }
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(config_path);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("playforged {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn decide(
    file: &Path,
    profile_path: Option<&Path>,
    config_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = Config::load_or_default(config_path);
    let profile = match profile_path {
        Some(p) => serde_json::from_str::<DeviceProfile>(&std::fs::read_to_string(p)?)?,
        None => DeviceProfile::default(),
    };

    let tools = ToolRegistry::discover(&config.tools);
    let prober = FfprobeProber::new(tools.require("ffprobe")?.to_path_buf());
    let engine = PlaybackDecisionEngine::new(config.ladder.default_quality);
    let decision = engine.decide_playback(&prober, file, &profile).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Device: {}", profile.name);
    println!("Method: {}", decision.method);
    println!("Reason: {}", decision.reason);
    if let Some(ref url) = decision.direct_play_url {
        println!("URL: {}", url);
    }
    if let Some(ref params) = decision.transcode_params {
        println!("\nTarget:");
        println!("  Container: {}", params.container);
        println!("  Video: {}", params.video_codec);
        println!("  Audio: {}", params.audio_codec);
        if decision.method == PlaybackMethod::Transcode {
            println!("  Resolution: {}x{}", params.width, params.height);
            if let Some(kbps) = params.video_bitrate {
                println!("  Video bitrate: {} kbps", kbps);
            }
            if let Some(ref rung) = params.rung {
                println!("  Rung: {}", rung);
            }
            if let Some(ref codecs) = params.codec_string {
                println!("  Codec string: {}", codecs);
            }
        }
    }

    Ok(())
}

fn print_ladder(
    ladder: &[BitrateLadderRung],
    (width, height, quality): (u32, u32, u8),
    bandwidth: Option<u32>,
    duration: Option<f64>,
    json: bool,
) -> Result<()> {
    let optimal = bandwidth.and_then(|kbps| get_optimal_rung(ladder, kbps));
    let storage = duration.map(|d| storage_requirements(ladder, d));

    if json {
        let value = serde_json::json!({
            "ladder": ladder,
            "optimal": optimal.map(|r| &r.label),
            "storage": storage,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Source: {}x{} (quality {})\n", width, height, quality);
    for rung in ladder {
        let marker = if optimal.is_some_and(|o| o.label == rung.label) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:>6} {:>4}x{:<4} {:>5} kbps video {:>4} kbps audio  {} {}  ({})",
            marker,
            rung.label,
            rung.width,
            rung.height,
            rung.video_bitrate,
            rung.audio_bitrate,
            rung.profile.as_str(),
            rung.level,
            rung.use_case
        );
    }

    if let Some(storage) = storage {
        println!(
            "\nStorage for {:.0}s: {:.1} MB ({:.2} GB)",
            storage.duration_secs,
            storage.total_size_mb,
            storage.total_size_gb()
        );
    }

    Ok(())
}

async fn transcode(input: PathBuf, config_path: Option<&Path>, options: TranscodeOptions) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {:?}", input);
    }

    let app = App::build(Config::load_or_default(config_path)).await?;
    let service = app.service.clone();

    let media_id = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    let mut request = TranscodeRequest::new(media_id, input.clone(), options.container);
    request.resolution = options.resolution;
    request.quality = options.quality.unwrap_or(app.config.ladder.default_quality);
    request.seek = options.seek;
    request.enable_abr = options.abr;
    if let Some(hw) = options.hw_accel {
        request.prefer_hardware = true;
        request.hardware_type = (hw != "auto").then_some(hw);
    }

    // Duration only drives the progress percentage.
    if let Ok(ffprobe) = app.tools.require("ffprobe") {
        match FfprobeProber::new(ffprobe.to_path_buf()).probe(&input).await {
            Ok(media) => request.duration = media.duration_secs,
            Err(e) => tracing::warn!("Probe failed, progress will not show a percentage: {e}"),
        }
    }

    let cancel = CancellationToken::new();
    let handle = tokio::select! {
        result = service.start_transcode(&cancel, request) => result?,
        _ = tokio::signal::ctrl_c() => {
            app.shutdown().await;
            anyhow::bail!("Interrupted while waiting for capacity");
        }
    };
    println!(
        "Session {} started with provider {}",
        handle.session_id, handle.provider
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let record = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping session...");
                service.stop_session(handle.session_id).await?;
            }
        }

        let record = service.session(handle.session_id).await?;
        if let Some(ref progress) = record.progress {
            print!(
                "\r{:5.1}%  frame {:>7}  {:>8}",
                progress.percent,
                progress.frame,
                progress.speed.map(|s| format!("{:.2}x", s)).unwrap_or_default()
            );
            std::io::stdout().flush()?;
        }
        if record.status.is_terminal() {
            println!();
            break record;
        }
    };

    app.shutdown().await;

    match record.status {
        TranscodeStatus::Completed => {
            println!("Transcode complete!");
            if let Some(ref dir) = record.directory_path {
                println!("Output: {}", dir.display());
            }
            if let Some(ref hash) = record.content_hash {
                println!("Content hash: {}", hash);
            }
            Ok(())
        }
        TranscodeStatus::Cancelled => {
            println!("Transcode cancelled");
            Ok(())
        }
        status => anyhow::bail!(
            "Transcode {}: {}",
            status,
            record.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

async fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools).check_all().await;
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable transcoding.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = Config::from_json(&std::fs::read_to_string(p)?)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let t = &config.transcoding;
    println!("  Max concurrent sessions: {}", t.max_concurrent_sessions);
    println!("  Queue: {} requests, {}s timeout", t.queue_size, t.queue_timeout_secs);
    println!("  Session timeout: {}s", t.session_timeout_secs);
    println!("  Output directory: {}", t.output_dir.display());
    println!(
        "  Kill windows: {}ms graceful, {}ms forced",
        config.process.graceful_kill_ms, config.process.forced_kill_ms
    );

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &warnings {
            println!("  - {}", warning);
        }
    }

    Ok(())
}
