use clap::{Parser, Subcommand, ValueEnum};
use pf_core::Resolution;
use pf_playback::ContentType;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "playforged")]
#[command(author, version, about = "Transcoding orchestration and playback decisions")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decide how a file should be played on a device
    Decide {
        /// Media file to inspect
        #[arg(required = true)]
        file: PathBuf,

        /// Device profile JSON file (defaults to a generic web browser)
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the ABR ladder for a source resolution
    Ladder {
        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        /// Quality 0-100 (defaults to the configured value)
        #[arg(short, long)]
        quality: Option<u8>,

        /// Available bandwidth in kbps; marks the rung that would be picked
        #[arg(short, long)]
        bandwidth: Option<u32>,

        /// Content duration in seconds, for a storage estimate
        #[arg(short, long)]
        duration: Option<f64>,

        /// Scale bitrates for the kind of content
        #[arg(long, value_enum)]
        content: Option<ContentArg>,

        /// Scene complexity 0.0-1.0, used with `--content other`
        #[arg(long, default_value_t = 0.5)]
        complexity: f64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Transcode a file through the full admission and provider pipeline
    Transcode {
        /// Input file
        #[arg(required = true)]
        input: PathBuf,

        /// Output container (mp4, webm, mkv, hls, dash)
        #[arg(long, default_value = "mp4")]
        container: String,

        /// Target resolution, e.g. 1280x720 or 720p
        #[arg(short, long)]
        resolution: Option<Resolution>,

        /// Quality 0-100
        #[arg(short, long)]
        quality: Option<u8>,

        /// Start offset in seconds
        #[arg(long)]
        seek: Option<f64>,

        /// Hardware acceleration (auto, videotoolbox, nvenc, vaapi, qsv)
        #[arg(long)]
        hw_accel: Option<String>,

        /// Produce an adaptive HLS ladder
        #[arg(long)]
        abr: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ContentArg {
    Animation,
    Sports,
    Film,
    Other,
}

impl From<ContentArg> for ContentType {
    fn from(arg: ContentArg) -> Self {
        match arg {
            ContentArg::Animation => ContentType::Animation,
            ContentArg::Sports => ContentType::Sports,
            ContentArg::Film => ContentType::Film,
            ContentArg::Other => ContentType::Other,
        }
    }
}
