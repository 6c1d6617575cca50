//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires a full [`TranscodeService`] over an
//! in-memory session store and a temporary output directory, and
//! [`MockProvider`], a scriptable in-process provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use playforged::core::config::ProcessConfig;
use playforged::core::events::EventBus;
use playforged::core::report::ErrorReporter;
use playforged::core::{Error, MediaCharacteristics, Result, SessionId};
use playforged::playback::{MediaProbe, PlaybackDecisionEngine};
use playforged::transcode::{
    ContainerFormat, MemorySessionStore, OutputLayout, ProcessSupervisor, ProviderCapabilities,
    ProviderInfo, ProviderRegistry, ResourceLimits, ResourceManager, RetentionPolicy,
    ServiceComponents, SessionRecord, SessionStore, TranscodeHandle, TranscodeRequest,
    TranscodeService, TranscodeStatus, TranscodingProgress, TranscodingProvider,
};

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// In-process provider whose sessions stay `Running` until the test calls
/// [`finish`](MockProvider::finish) or [`fail`](MockProvider::fail).
pub struct MockProvider {
    id: String,
    priority: i32,
    formats: Vec<&'static str>,
    layout: OutputLayout,
    start_delay: Duration,
    fail_start: bool,
    jobs: Mutex<HashMap<SessionId, TranscodingProgress>>,
    started: AtomicUsize,
    stopped: Mutex<Vec<SessionId>>,
}

impl MockProvider {
    pub fn new(id: &str, priority: i32, formats: &[&'static str], layout: OutputLayout) -> Self {
        Self {
            id: id.to_string(),
            priority,
            formats: formats.to_vec(),
            layout,
            start_delay: Duration::ZERO,
            fail_start: false,
            jobs: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<SessionId> {
        self.stopped.lock().clone()
    }

    pub fn finish(&self, session_id: SessionId) {
        if let Some(job) = self.jobs.lock().get_mut(&session_id) {
            job.status = TranscodeStatus::Completed;
            job.percent = 100.0;
            job.bytes_written = 6;
        }
    }

    pub fn fail(&self, session_id: SessionId, message: &str) {
        if let Some(job) = self.jobs.lock().get_mut(&session_id) {
            job.status = TranscodeStatus::Failed;
            job.error = Some(message.to_string());
        }
    }

    pub fn set_percent(&self, session_id: SessionId, percent: f64) {
        if let Some(job) = self.jobs.lock().get_mut(&session_id) {
            job.percent = percent;
        }
    }
}

#[async_trait]
impl TranscodingProvider for MockProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: format!("Mock {}", self.id),
            description: "test provider".into(),
            version: "0.0.0".into(),
            author: "tests".into(),
            priority: self.priority,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            formats: self
                .formats
                .iter()
                .map(|&f| ContainerFormat::new(f, "video/x-test", &[f], false))
                .collect(),
            ..Default::default()
        }
    }

    async fn start_transcode(&self, request: &TranscodeRequest) -> Result<TranscodeHandle> {
        let session_id = request
            .session_id
            .ok_or_else(|| Error::Validation("missing session".into()))?;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            return Err(Error::transcode(&self.id, session_id, "mock start failure"));
        }
        self.started.fetch_add(1, Ordering::SeqCst);

        let dir = self
            .layout
            .prepare_session_dir(&request.container, &self.id, session_id)
            .await?;
        tokio::fs::write(dir.join("output.bin"), request.media_id.as_bytes()).await?;

        self.jobs.lock().insert(
            session_id,
            TranscodingProgress::new(session_id, TranscodeStatus::Running),
        );
        Ok(TranscodeHandle {
            session_id,
            provider: self.id.clone(),
            status: TranscodeStatus::Running,
            started_at: chrono::Utc::now(),
            directory: dir,
        })
    }

    async fn progress(&self, session_id: SessionId) -> Result<TranscodingProgress> {
        self.jobs
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    async fn stop_transcode(&self, session_id: SessionId) -> Result<()> {
        self.stopped.lock().push(session_id);
        if let Some(job) = self.jobs.lock().get_mut(&session_id) {
            job.status = TranscodeStatus::Cancelled;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticProbe
// ---------------------------------------------------------------------------

/// Returns fixed characteristics for every path, or a probe error when empty.
pub struct StaticProbe(pub Option<MediaCharacteristics>);

#[async_trait]
impl MediaProbe for StaticProbe {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn probe(&self, path: &Path) -> Result<MediaCharacteristics> {
        self.0
            .clone()
            .ok_or_else(|| Error::Probe(format!("cannot probe {}", path.display())))
    }
}

pub fn media(container: &str, video: Option<&str>, audio: Option<&str>) -> MediaCharacteristics {
    MediaCharacteristics {
        container: container.into(),
        video_codec: video.map(String::from),
        audio_codec: audio.map(String::from),
        width: 1920,
        height: 1080,
        bitrate: 8000,
        duration_secs: Some(600.0),
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

pub fn test_limits() -> ResourceLimits {
    ResourceLimits {
        max_concurrent_sessions: 2,
        session_timeout: Duration::from_secs(3600),
        queue_size: 5,
        queue_timeout: Duration::from_secs(5),
        capacity_poll_interval: Duration::from_millis(10),
        monitor_interval: Duration::from_millis(50),
    }
}

pub struct TestHarness {
    pub service: Arc<TranscodeService>,
    pub registry: Arc<ProviderRegistry>,
    pub resources: Arc<ResourceManager>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub store: Arc<MemorySessionStore>,
    pub events: Arc<EventBus>,
    pub reporter: Arc<ErrorReporter>,
    pub layout: OutputLayout,
    _tmp: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_limits(test_limits())
    }

    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self::build(limits, ProcessConfig::default(), StaticProbe(None))
    }

    pub fn with_probe(probe: StaticProbe) -> Self {
        Self::build(test_limits(), ProcessConfig::default(), probe)
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self::build_with(test_limits(), ProcessConfig::default(), StaticProbe(None), retention)
    }

    pub fn build(limits: ResourceLimits, process: ProcessConfig, probe: StaticProbe) -> Self {
        Self::build_with(limits, process, probe, RetentionPolicy::default())
    }

    fn build_with(
        limits: ResourceLimits,
        process: ProcessConfig,
        probe: StaticProbe,
        retention: RetentionPolicy,
    ) -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let layout = OutputLayout::new(tmp.path().join("transcodes"));
        let reporter = Arc::new(ErrorReporter::default());
        let events = Arc::new(EventBus::default());
        let supervisor =
            Arc::new(ProcessSupervisor::new(process).with_events(Arc::clone(&events)));
        let resources = ResourceManager::start(limits, Arc::clone(&reporter));
        let registry = Arc::new(ProviderRegistry::new());
        let store = Arc::new(MemorySessionStore::new());

        let service = TranscodeService::start(
            ServiceComponents {
                probe: Arc::new(probe),
                registry: Arc::clone(&registry),
                resources: Arc::clone(&resources),
                supervisor: Arc::clone(&supervisor),
                store: store.clone() as Arc<dyn SessionStore>,
                layout: layout.clone(),
                events: Arc::clone(&events),
                reporter: Arc::clone(&reporter),
                retention,
            },
            PlaybackDecisionEngine::default(),
            Duration::from_millis(20),
        );

        Self {
            service,
            registry,
            resources,
            supervisor,
            store,
            events,
            reporter,
            layout,
            _tmp: tmp,
        }
    }

    /// Register a mock provider and return it.
    pub fn mock(&self, id: &str, priority: i32, formats: &[&'static str]) -> Arc<MockProvider> {
        self.add(MockProvider::new(id, priority, formats, self.layout.clone()))
    }

    pub fn add(&self, provider: MockProvider) -> Arc<MockProvider> {
        let provider = Arc::new(provider);
        self.registry
            .register(provider.clone())
            .expect("failed to register provider");
        provider
    }

    /// Poll the store until the session reaches `status`.
    pub async fn wait_for_status(&self, session_id: SessionId, status: TranscodeStatus) -> SessionRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(record) = self.store.get(session_id).await.expect("store get") {
                if record.status == status {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {session_id} never reached {status}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `cond` holds.
    pub async fn eventually(&self, what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn request(media_id: &str, container: &str) -> TranscodeRequest {
    TranscodeRequest::new(media_id, format!("/media/{media_id}.mkv"), container)
}
