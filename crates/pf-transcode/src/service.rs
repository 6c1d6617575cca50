//! The orchestration facade.
//!
//! [`TranscodeService`] ties the pieces together: playback decisions, request
//! deduplication, admission through the [`ResourceManager`], provider
//! selection, progress monitoring, content-addressed publication and
//! stopping sessions (including their encoder processes).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use pf_core::events::{EventBus, EventCategory, EventPayload};
use pf_core::report::ErrorReporter;
use pf_core::task::{spawn_supervised, SupervisedTask};
use pf_core::{DeviceProfile, Error, ErrorKind, Resolution, Result, SessionId};
use pf_playback::{MediaProbe, PlaybackDecision, PlaybackDecisionEngine, TranscodeParams, COPY_CODEC};

use crate::output::OutputLayout;
use crate::process::ProcessSupervisor;
use crate::provider::TranscodingProvider;
use crate::registry::{ProviderRegistry, ProviderSummary};
use crate::resource::{start_fn, EvictionReason, ResourceManager, ResourceUsage};
use crate::retention::{RetentionPolicy, RetentionSweeper};
use crate::store::{SessionRecord, SessionStore, SessionUpdate};
use crate::types::{TranscodeHandle, TranscodeRequest, TranscodeResult, TranscodeStatus, TranscodingProgress};

/// Everything the service is built from. Each part is shared, so tests can
/// keep their own handles.
pub struct ServiceComponents {
    pub probe: Arc<dyn MediaProbe>,
    pub registry: Arc<ProviderRegistry>,
    pub resources: Arc<ResourceManager>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub store: Arc<dyn SessionStore>,
    pub layout: OutputLayout,
    pub events: Arc<EventBus>,
    pub reporter: Arc<ErrorReporter>,
    pub retention: RetentionPolicy,
}

pub struct TranscodeService {
    engine: PlaybackDecisionEngine,
    probe: Arc<dyn MediaProbe>,
    registry: Arc<ProviderRegistry>,
    resources: Arc<ResourceManager>,
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<dyn SessionStore>,
    layout: OutputLayout,
    events: Arc<EventBus>,
    reporter: Arc<ErrorReporter>,
    progress_interval: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<SupervisedTask<()>>>,
}

impl TranscodeService {
    /// Build the service and start its background tasks: the eviction
    /// listener, the orphan process sweep and the retention sweep.
    pub fn start(
        components: ServiceComponents,
        engine: PlaybackDecisionEngine,
        progress_interval: Duration,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            engine,
            probe: components.probe,
            registry: components.registry,
            resources: components.resources,
            supervisor: components.supervisor,
            store: components.store,
            layout: components.layout,
            events: components.events,
            reporter: components.reporter,
            progress_interval,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let sweeper = service
            .supervisor
            .start_sweeper(Arc::clone(&service.reporter), service.shutdown.child_token());
        let retention = Arc::new(RetentionSweeper::new(
            Arc::clone(&service.store),
            service.layout.clone(),
            components.retention,
        ))
        .start(Arc::clone(&service.reporter), service.shutdown.child_token());
        let listener = spawn_supervised(
            "eviction_listener",
            Arc::clone(&service.reporter),
            Arc::clone(&service).listen_for_evictions(),
        );
        service.tasks.lock().extend([sweeper, retention, listener]);

        tracing::info!(
            providers = service.registry.len(),
            output_dir = %service.layout.root().display(),
            "Transcode service started"
        );
        service
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn providers(&self) -> Vec<ProviderSummary> {
        self.registry.providers()
    }

    // -- Decisions -----------------------------------------------------------

    pub async fn decide_playback(
        &self,
        media_path: &Path,
        profile: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        self.engine
            .decide_playback(self.probe.as_ref(), media_path, profile)
            .await
    }

    // -- Sessions ------------------------------------------------------------

    /// Admit and start a transcode.
    ///
    /// A running or completed session producing the same output is returned
    /// instead of starting a second encode. Otherwise the request goes
    /// through admission control and may wait in the queue; `cancel` aborts
    /// that wait.
    pub async fn start_transcode(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        mut request: TranscodeRequest,
    ) -> Result<TranscodeHandle> {
        request.validate()?;

        if let Some(existing) = self.store.find_by_request_key(&request.content_key()).await? {
            tracing::info!(
                session_id = %existing.session_id,
                media_id = %request.media_id,
                status = %existing.status,
                "Reusing existing session for identical request"
            );
            return Ok(self.handle_for(&existing));
        }

        let session_id = *request.session_id.get_or_insert_with(SessionId::new);
        self.events.broadcast(
            EventCategory::Session,
            EventPayload::TranscodeQueued {
                session_id,
                media_id: request.media_id.clone(),
            },
        );

        let service = Arc::clone(self);
        let start = start_fn(move |request| Arc::clone(&service).execute(request));

        self.resources
            .start_transcode(cancel, request, start)
            .await
            .map_err(|e| e.in_op("start_transcode"))
    }

    /// Stop a session: provider stop, process kill, bookkeeping.
    pub async fn stop_session(&self, session_id: SessionId) -> Result<()> {
        self.terminate(session_id, TranscodeStatus::Cancelled).await
    }

    pub async fn session(&self, session_id: SessionId) -> Result<SessionRecord> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    pub async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store.list().await
    }

    /// Where a session's output currently lives.
    pub async fn output_dir(&self, session_id: SessionId) -> Result<PathBuf> {
        let record = self.session(session_id).await?;
        self.layout.resolve_session_dir(
            &record.request.container,
            &record.provider,
            session_id,
            record.content_hash.as_deref(),
        )
    }

    pub fn get_resource_usage(&self) -> ResourceUsage {
        self.resources.get_resource_usage()
    }

    /// Stop background work, fail queued requests and kill every encoder.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down transcode service");
        self.shutdown.cancel();
        self.resources.shutdown().await;

        let report = self.supervisor.kill_all().await;
        for pid in &report.failed {
            self.reporter
                .report("transcode_service", &Error::Unkillable { pid: *pid });
        }

        let tasks: Vec<SupervisedTask<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let name = task.name().to_string();
            if let Err(e) = task.join().await {
                tracing::debug!(task = %name, error = %e, "Task ended with error");
            }
        }
    }

    // -- Internals -----------------------------------------------------------

    fn handle_for(&self, record: &SessionRecord) -> TranscodeHandle {
        let directory = record.directory_path.clone().unwrap_or_else(|| {
            self.layout
                .session_dir(&record.request.container, &record.provider, record.session_id)
        });
        TranscodeHandle {
            session_id: record.session_id,
            provider: record.provider.clone(),
            status: record.status,
            started_at: record.start_time,
            directory,
        }
    }

    /// Runs once the request is admitted.
    async fn execute(self: Arc<Self>, request: TranscodeRequest) -> Result<TranscodeHandle> {
        let session_id = request
            .session_id
            .ok_or_else(|| Error::Internal("admitted request has no session ID".into()))?;
        let selected = self.registry.select_provider(&request)?;
        let provider_id = selected.info.id.clone();

        self.store
            .create(SessionRecord::new(session_id, &provider_id, request.clone()))
            .await?;

        let handle = match selected.provider.start_transcode(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    provider = %provider_id,
                    error = %e,
                    "Provider failed to start transcode"
                );
                self.store
                    .update(session_id, SessionUpdate::failed(e.to_string()))
                    .await?;
                self.events.broadcast(
                    EventCategory::Session,
                    EventPayload::TranscodeFailed {
                        session_id,
                        error: e.to_string(),
                    },
                );
                return Err(e
                    .in_op("provider_start")
                    .with_session(session_id)
                    .with_detail("provider", &provider_id));
            }
        };

        self.store
            .update(
                session_id,
                SessionUpdate {
                    status: Some(TranscodeStatus::Running),
                    directory_path: Some(handle.directory.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.events.broadcast(
            EventCategory::Session,
            EventPayload::TranscodeStarted {
                session_id,
                provider: provider_id.clone(),
            },
        );
        tracing::info!(
            session_id = %session_id,
            provider = %provider_id,
            directory = %handle.directory.display(),
            "Transcode started"
        );

        let monitor = spawn_supervised(
            format!("progress_monitor:{session_id}"),
            Arc::clone(&self.reporter),
            Arc::clone(&self).monitor_session(
                session_id,
                Arc::clone(&selected.provider),
                handle.directory.clone(),
            ),
        );
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(monitor);
        }

        Ok(handle)
    }

    /// Poll provider progress until the session ends.
    async fn monitor_session(
        self: Arc<Self>,
        session_id: SessionId,
        provider: Arc<dyn TranscodingProvider>,
        directory: PathBuf,
    ) -> Result<()> {
        let started = Instant::now();
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut attached = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            if !attached {
                for process in self.supervisor.processes_for_session(session_id) {
                    attached |= self.resources.attach_process(session_id, process.pid).is_ok();
                }
            }

            let progress = match provider.progress(session_id).await {
                Ok(progress) => progress,
                Err(e) => {
                    let e = e.in_op("progress").with_session(session_id);
                    self.fail_session(session_id, &e.to_string()).await;
                    return Err(e);
                }
            };

            // stop_session already recorded the outcome.
            if let Some(record) = self.store.get(session_id).await? {
                if matches!(record.status, TranscodeStatus::Cancelled | TranscodeStatus::TimedOut) {
                    return Ok(());
                }
            }

            match progress.status {
                TranscodeStatus::Completed => {
                    return self
                        .complete_session(session_id, &directory, progress, started.elapsed())
                        .await;
                }
                TranscodeStatus::Failed => {
                    let message = progress
                        .error
                        .clone()
                        .unwrap_or_else(|| "provider reported failure".into());
                    self.fail_session(session_id, &message).await;
                    return Ok(());
                }
                TranscodeStatus::Cancelled | TranscodeStatus::TimedOut => {
                    let _ = self.resources.update_session_status(session_id, progress.status);
                    self.store
                        .update(session_id, SessionUpdate::status(progress.status))
                        .await?;
                    return Ok(());
                }
                TranscodeStatus::Queued | TranscodeStatus::Admitted | TranscodeStatus::Running => {
                    // Untracked sessions are caught by the store check above.
                    let _ = self
                        .resources
                        .update_session_status(session_id, TranscodeStatus::Running);
                    self.store
                        .update(
                            session_id,
                            SessionUpdate {
                                progress: Some(progress.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.events.broadcast(
                        EventCategory::Session,
                        EventPayload::TranscodeProgress {
                            session_id,
                            percent: progress.percent,
                            speed: progress.speed,
                        },
                    );
                }
            }
        }
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        directory: &Path,
        progress: TranscodingProgress,
        elapsed: Duration,
    ) -> Result<()> {
        let _ = self
            .resources
            .update_session_status(session_id, TranscodeStatus::Completed);

        let published = if directory.is_dir() {
            match self.layout.publish(directory).await {
                Ok(published) => Some(published),
                Err(e) => {
                    self.reporter
                        .report("publish", &e.with_session(session_id));
                    None
                }
            }
        } else {
            None
        };

        let output_dir = published
            .as_ref()
            .map_or_else(|| directory.to_path_buf(), |p| p.path.clone());
        let content_hash = published.as_ref().map(|p| p.content_hash.clone());

        self.store
            .update(
                session_id,
                SessionUpdate {
                    status: Some(TranscodeStatus::Completed),
                    result: Some(TranscodeResult {
                        success: true,
                        output_dir: output_dir.clone(),
                        content_hash: content_hash.clone(),
                        bytes_written: progress.bytes_written,
                        duration_secs: elapsed.as_secs_f64(),
                        error: None,
                    }),
                    progress: Some(progress),
                    directory_path: Some(output_dir),
                    content_hash: content_hash.clone(),
                    ..Default::default()
                },
            )
            .await?;

        self.events.broadcast(
            EventCategory::Session,
            EventPayload::TranscodeCompleted { session_id },
        );
        if let Some(content_hash) = content_hash {
            self.events.broadcast(
                EventCategory::Session,
                EventPayload::ContentPublished {
                    session_id,
                    content_hash,
                },
            );
        }
        tracing::info!(session_id = %session_id, "Transcode completed");
        Ok(())
    }

    async fn fail_session(&self, session_id: SessionId, message: &str) {
        tracing::warn!(session_id = %session_id, error = %message, "Transcode failed");
        let _ = self
            .resources
            .update_session_status(session_id, TranscodeStatus::Failed);
        if let Err(e) = self
            .store
            .update(session_id, SessionUpdate::failed(message))
            .await
        {
            self.reporter.report("fail_session", &e);
        }
        self.events.broadcast(
            EventCategory::Session,
            EventPayload::TranscodeFailed {
                session_id,
                error: message.to_string(),
            },
        );
    }

    async fn terminate(&self, session_id: SessionId, status: TranscodeStatus) -> Result<()> {
        let record = self.session(session_id).await?;
        let live = !record.status.is_terminal();

        // Recorded first so a provider reporting its own cancellation cannot
        // overwrite the outcome.
        if live {
            self.store
                .update(session_id, SessionUpdate::status(status))
                .await?;
        }

        match self.registry.get(&record.provider) {
            Ok(registered) => {
                if let Err(e) = registered.provider.stop_transcode(session_id).await {
                    tracing::warn!(
                        session_id = %session_id,
                        provider = %record.provider,
                        error = %e,
                        "Provider failed to stop session"
                    );
                }
            }
            Err(e) => tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Provider gone, killing processes directly"
            ),
        }

        let killed = self.supervisor.kill_session(session_id).await;
        self.resources.remove_session(session_id);

        if live {
            self.events.broadcast(
                EventCategory::Session,
                EventPayload::TranscodeCancelled { session_id },
            );
            tracing::info!(session_id = %session_id, status = %status, "Session stopped");
        }

        killed.map(|_| ()).map_err(|e| e.in_op("stop_session"))
    }

    async fn listen_for_evictions(self: Arc<Self>) -> Result<()> {
        let mut evictions = self.resources.subscribe_evictions();
        loop {
            let eviction = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = evictions.recv() => match received {
                    Ok(eviction) => eviction,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Eviction listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            self.events.broadcast(
                EventCategory::System,
                EventPayload::SessionEvicted {
                    session_id: eviction.session_id,
                    reason: eviction.reason.to_string(),
                },
            );

            if eviction.reason != EvictionReason::TimedOut {
                continue;
            }
            match self.terminate(eviction.session_id, TranscodeStatus::TimedOut).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Session => {}
                Err(e) => self.reporter.report("eviction_listener", &e),
            }
        }
        tracing::debug!("Eviction listener stopped");
        Ok(())
    }
}

/// Turn a transcode or remux decision into a request.
pub fn request_for_params(
    media_id: impl Into<String>,
    input_path: impl Into<PathBuf>,
    params: &TranscodeParams,
) -> TranscodeRequest {
    let mut request = TranscodeRequest::new(media_id, input_path, params.container.clone());
    request.video_codec = Some(params.video_codec.clone());
    request.audio_codec = Some(params.audio_codec.clone());
    if params.video_codec != COPY_CODEC && params.width > 0 && params.height > 0 {
        request.resolution = Some(Resolution::new(params.width, params.height));
    }
    request.video_bitrate = params.video_bitrate;
    request.audio_bitrate = params.audio_bitrate;
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(video: &str) -> TranscodeParams {
        TranscodeParams {
            container: "mp4".into(),
            video_codec: video.into(),
            audio_codec: "aac".into(),
            width: 1280,
            height: 720,
            video_bitrate: Some(1500),
            audio_bitrate: Some(96),
            crf: Some(26),
            h264_profile: None,
            level: None,
            codec_string: None,
            rung: Some("720p".into()),
        }
    }

    #[test]
    fn transcode_params_become_request() {
        let req = request_for_params("m1", "/media/a.mkv", &params("h264"));
        assert_eq!(req.container, "mp4");
        assert_eq!(req.video_codec.as_deref(), Some("h264"));
        assert_eq!(req.resolution, Some(Resolution::new(1280, 720)));
        assert_eq!(req.video_bitrate, Some(1500));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn remux_params_keep_source_size() {
        let req = request_for_params("m1", "/media/a.mkv", &params(COPY_CODEC));
        assert_eq!(req.video_codec.as_deref(), Some("copy"));
        assert_eq!(req.resolution, None);
    }
}
