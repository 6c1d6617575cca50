//! Application wiring: builds a [`TranscodeService`] from a [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pf_core::config::Config;
use pf_core::events::EventBus;
use pf_core::report::ErrorReporter;
use pf_core::tools::ToolRegistry;
use pf_core::Result;
use pf_playback::{FfprobeProber, PlaybackDecisionEngine};
use pf_transcode::{
    FfmpegProvider, MemorySessionStore, OutputLayout, ProcessSupervisor, ProviderRegistry,
    ResourceLimits, ResourceManager, RetentionPolicy, ServiceComponents, TranscodeService,
};

/// A running instance.
pub struct App {
    pub config: Config,
    pub tools: ToolRegistry,
    pub service: Arc<TranscodeService>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!("Config: {warning}");
        }

        let tools = ToolRegistry::discover(&config.tools);
        let reporter = Arc::new(ErrorReporter::new(config.errors.capacity));
        let events = Arc::new(EventBus::default());
        let supervisor = Arc::new(
            ProcessSupervisor::new(config.process.clone()).with_events(Arc::clone(&events)),
        );
        let resources = ResourceManager::start(
            ResourceLimits::from(&config.transcoding),
            Arc::clone(&reporter),
        );
        let layout = OutputLayout::new(config.transcoding.output_dir.clone());

        let registry = Arc::new(ProviderRegistry::new());
        match tools.require("ffmpeg") {
            Ok(ffmpeg) => registry.register(Arc::new(
                FfmpegProvider::detect(ffmpeg.to_path_buf(), layout.clone(), Arc::clone(&supervisor))
                    .await,
            ))?,
            Err(e) => tracing::warn!("ffmpeg provider disabled: {e}"),
        }

        // Probing fails with a tool error at call time if ffprobe is missing.
        let ffprobe = tools
            .require("ffprobe")
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from("ffprobe"));

        let service = TranscodeService::start(
            ServiceComponents {
                probe: Arc::new(FfprobeProber::new(ffprobe)),
                registry,
                resources,
                supervisor,
                store: Arc::new(MemorySessionStore::new()),
                layout,
                events,
                reporter,
                retention: RetentionPolicy::from(&config.cleanup),
            },
            PlaybackDecisionEngine::new(config.ladder.default_quality),
            config.transcoding.progress_interval(),
        );

        Ok(Self {
            config,
            tools,
            service,
        })
    }

    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }
}
