//! Admission control for transcode sessions.
//!
//! [`ResourceManager`] caps the number of concurrently tracked sessions.
//! Requests that arrive while the node is full wait in a bounded FIFO queue;
//! a single worker task admits them one at a time as capacity frees up. A
//! second task periodically evicts sessions that outlived the session
//! timeout or already reached a terminal status.
//!
//! Capacity is counted as `tracked sessions + reserved slots`. A slot is
//! reserved before the start function runs and converted into a tracked
//! session (or released) when it returns, so the cap holds even while
//! providers are still spinning up.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use pf_core::config::TranscodingConfig;
use pf_core::report::ErrorReporter;
use pf_core::task::{catch_panic, guard, spawn_supervised, SupervisedTask};
use pf_core::{is_complex_codec, Error, Result, SessionId};

use crate::types::{TranscodeHandle, TranscodeRequest, TranscodeStatus};

/// Suggested back-off when the queue is full.
const QUEUE_FULL_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Baseline memory for any encoder process, in MB.
const BASE_MEMORY_MB: u64 = 200;

/// Pixels per additional MB in the memory estimate.
const PIXELS_PER_MB: u64 = 100_000;

/// Starts the actual encode once a request is admitted.
pub type StartFn =
    Arc<dyn Fn(TranscodeRequest) -> BoxFuture<'static, Result<TranscodeHandle>> + Send + Sync>;

/// Wrap an async closure as a [`StartFn`].
pub fn start_fn<F, Fut>(f: F) -> StartFn
where
    F: Fn(TranscodeRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TranscodeHandle>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_concurrent_sessions: usize,
    pub session_timeout: Duration,
    pub queue_size: usize,
    pub queue_timeout: Duration,
    pub capacity_poll_interval: Duration,
    pub monitor_interval: Duration,
}

impl From<&TranscodingConfig> for ResourceLimits {
    fn from(config: &TranscodingConfig) -> Self {
        Self {
            max_concurrent_sessions: config.max_concurrent_sessions,
            session_timeout: config.session_timeout(),
            queue_size: config.queue_size,
            queue_timeout: config.queue_timeout(),
            capacity_poll_interval: config.capacity_poll_interval(),
            monitor_interval: config.monitor_interval(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&TranscodingConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tracked state
// ---------------------------------------------------------------------------

/// A session the manager is counting against capacity.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResource {
    pub session_id: SessionId,
    pub media_id: String,
    pub provider: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub status: TranscodeStatus,
    pub estimated_memory_mb: u64,
    pub process_ids: Vec<i32>,
    #[serde(skip)]
    started: Instant,
}

/// Per-session line of [`ResourceUsage`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub media_id: String,
    pub provider: String,
    pub status: TranscodeStatus,
    pub duration_secs: u64,
    pub estimated_memory_mb: u64,
}

/// Snapshot returned by [`ResourceManager::get_resource_usage`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub active_sessions: usize,
    pub max_concurrent_sessions: usize,
    pub queued_requests: usize,
    pub max_queue_size: usize,
    pub total_estimated_memory_mb: u64,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Ran longer than the session timeout.
    TimedOut,
    /// Had already reported a terminal status.
    Finished,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed_out"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// A session removed by the monitor. The encoder behind a timed-out session
/// may still be running; subscribers are expected to stop it.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub session_id: SessionId,
    pub provider: String,
    pub status: TranscodeStatus,
    pub reason: EvictionReason,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, SessionResource>,
    reserved: usize,
}

impl SessionTable {
    fn occupied(&self) -> usize {
        self.sessions.len() + self.reserved
    }
}

struct QueuedRequest {
    ticket: u64,
    request: TranscodeRequest,
    start_fn: StartFn,
    result_tx: oneshot::Sender<Result<TranscodeHandle>>,
    timeout: Duration,
    queued_at: Instant,
}

/// Removes a queued request if its waiter goes away before the worker
/// picks it up.
struct QueueTicket<'a> {
    queue: &'a Mutex<VecDeque<QueuedRequest>>,
    ticket: u64,
    armed: bool,
}

impl QueueTicket<'_> {
    /// Pull the request out of the queue. `false` means the worker already
    /// took it.
    fn withdraw(&mut self) -> bool {
        self.armed = false;
        let mut queue = self.queue.lock();
        match queue.iter().position(|q| q.ticket == self.ticket) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.withdraw();
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

pub struct ResourceManager {
    limits: ResourceLimits,
    table: RwLock<SessionTable>,
    queue: Mutex<VecDeque<QueuedRequest>>,
    next_ticket: AtomicU64,
    /// Signalled when work is queued.
    work: Notify,
    /// Signalled when capacity is freed.
    capacity: Notify,
    evictions: broadcast::Sender<Eviction>,
    reporter: Arc<ErrorReporter>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<SupervisedTask<()>>>,
}

impl ResourceManager {
    /// Build the manager without background tasks. Queued requests are only
    /// admitted once [`start`](Self::start) has run.
    pub fn new(limits: ResourceLimits, reporter: Arc<ErrorReporter>) -> Self {
        let (evictions, _) = broadcast::channel(64);
        Self {
            limits,
            table: RwLock::new(SessionTable::default()),
            queue: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(1),
            work: Notify::new(),
            capacity: Notify::new(),
            evictions,
            reporter,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the manager and spawn the queue worker and session monitor.
    pub fn start(limits: ResourceLimits, reporter: Arc<ErrorReporter>) -> Arc<Self> {
        let manager = Arc::new(Self::new(limits, reporter));

        let worker = {
            let m = Arc::clone(&manager);
            spawn_supervised("queue_worker", Arc::clone(&manager.reporter), async move {
                m.run_queue_worker().await;
                Ok(())
            })
        };
        let monitor = {
            let m = Arc::clone(&manager);
            spawn_supervised("session_monitor", Arc::clone(&manager.reporter), async move {
                m.run_session_monitor().await;
                Ok(())
            })
        };
        manager.tasks.lock().extend([worker, monitor]);

        tracing::info!(
            max_sessions = manager.limits.max_concurrent_sessions,
            queue_size = manager.limits.queue_size,
            "Resource manager started"
        );
        manager
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Subscribe to sessions evicted by the monitor.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    /// Admit `request`, waiting in the queue if the node is full.
    ///
    /// Validation failures are returned without queueing. While queued, the
    /// wait ends on admission, on the queue timeout ([`Error::Timeout`]), on
    /// `cancel` ([`Error::Cancelled`]) or on shutdown. A request that gave up
    /// waiting is withdrawn from the queue and never admitted afterwards.
    /// Cancelling does not stop an encoder that was already started.
    pub async fn start_transcode(
        &self,
        cancel: &CancellationToken,
        mut request: TranscodeRequest,
        start_fn: StartFn,
    ) -> Result<TranscodeHandle> {
        request.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("resource manager is shut down".into()));
        }
        let session_id = *request.session_id.get_or_insert_with(SessionId::new);

        let admitted_now = {
            let queue = self.queue.lock();
            queue.is_empty() && self.try_reserve()
        };
        if admitted_now {
            return self.execute(request, start_fn).await;
        }

        let (result_tx, mut result_rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let timeout = self.limits.queue_timeout;
        let position = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.limits.queue_size {
                return Err(Error::QueueFull {
                    capacity: self.limits.queue_size,
                    retry_after: QUEUE_FULL_RETRY_AFTER,
                });
            }
            queue.push_back(QueuedRequest {
                ticket,
                request,
                start_fn,
                result_tx,
                timeout,
                queued_at: Instant::now(),
            });
            queue.len()
        };
        self.work.notify_one();

        tracing::info!(
            session_id = %session_id,
            position,
            active = self.active_sessions(),
            "Transcode request queued"
        );

        let mut pending = QueueTicket {
            queue: &self.queue,
            ticket,
            armed: true,
        };

        let abandoned = tokio::select! {
            biased;
            result = &mut result_rx => {
                pending.armed = false;
                return result.unwrap_or_else(|_| {
                    Err(Error::Cancelled("queued request dropped by worker".into()))
                });
            }
            _ = tokio::time::sleep(timeout) => Error::Timeout(format!(
                "request for session {session_id} waited {timeout:?} in queue"
            )),
            _ = cancel.cancelled() => Error::Cancelled(format!(
                "request for session {session_id} cancelled while queued"
            )),
            _ = self.shutdown.cancelled() => {
                Error::Cancelled("resource manager shutting down".into())
            }
        };

        if pending.withdraw() {
            tracing::info!(session_id = %session_id, error = %abandoned, "Queued request withdrawn");
            return Err(abandoned.with_session(session_id));
        }

        // The worker took it first; its outcome stands.
        result_rx
            .await
            .unwrap_or_else(|_| Err(abandoned.with_session(session_id)))
    }

    /// Run `start_fn` against a reserved slot and track the session.
    async fn execute(&self, request: TranscodeRequest, start_fn: StartFn) -> Result<TranscodeHandle> {
        let media_id = request.media_id.clone();
        let estimated_memory_mb = Self::estimate_memory_usage(&request);

        match catch_panic("transcode_start", &self.reporter, start_fn(request)).await {
            Ok(handle) => {
                let now = Utc::now();
                let active = {
                    let mut table = self.table.write();
                    table.reserved = table.reserved.saturating_sub(1);
                    table.sessions.insert(
                        handle.session_id,
                        SessionResource {
                            session_id: handle.session_id,
                            media_id,
                            provider: handle.provider.clone(),
                            start_time: now,
                            last_update: now,
                            status: handle.status,
                            estimated_memory_mb,
                            process_ids: Vec::new(),
                            started: Instant::now(),
                        },
                    );
                    table.sessions.len()
                };
                tracing::info!(
                    session_id = %handle.session_id,
                    provider = %handle.provider,
                    active_sessions = active,
                    estimated_memory_mb,
                    "Started transcoding session with resource tracking"
                );
                Ok(handle)
            }
            Err(e) => {
                self.release_reservation();
                tracing::warn!(media_id = %media_id, error = %e, "Transcode start failed");
                Err(e)
            }
        }
    }

    fn try_reserve(&self) -> bool {
        let mut table = self.table.write();
        if table.occupied() < self.limits.max_concurrent_sessions {
            table.reserved += 1;
            true
        } else {
            false
        }
    }

    fn release_reservation(&self) {
        {
            let mut table = self.table.write();
            table.reserved = table.reserved.saturating_sub(1);
        }
        self.capacity.notify_one();
    }

    // -- Background tasks ----------------------------------------------------

    async fn run_queue_worker(&self) {
        tracing::debug!("Queue worker started");

        loop {
            if !self.wait_for_work().await || !self.wait_for_capacity().await {
                break;
            }

            let next = self.queue.lock().pop_front();
            let Some(item) = next else {
                // Whatever we were waiting for was withdrawn.
                self.release_reservation();
                continue;
            };

            let session_id = item.request.session_id;
            if item.queued_at.elapsed() >= item.timeout {
                self.release_reservation();
                let _ = item.result_tx.send(Err(Error::Timeout(
                    "request expired in queue".into(),
                )));
                continue;
            }
            if item.result_tx.is_closed() {
                self.release_reservation();
                continue;
            }

            tracing::debug!(
                session_id = ?session_id,
                waited_ms = item.queued_at.elapsed().as_millis() as u64,
                "Admitting queued request"
            );
            let result = self.execute(item.request, item.start_fn).await;
            if let Err(Ok(handle)) = item.result_tx.send(result) {
                tracing::warn!(
                    session_id = %handle.session_id,
                    "Queued caller left after admission; session keeps running"
                );
            }
        }

        tracing::debug!("Queue worker stopped");
    }

    /// `false` on shutdown.
    async fn wait_for_work(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if !self.queue.lock().is_empty() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.work.notified() => {}
            }
        }
    }

    /// Reserve a slot, polling until one frees up. `false` on shutdown.
    async fn wait_for_capacity(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if self.try_reserve() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.capacity.notified() => {}
                _ = tokio::time::sleep(self.limits.capacity_poll_interval) => {}
            }
        }
    }

    async fn run_session_monitor(&self) {
        let mut interval = tokio::time::interval(self.limits.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            guard("session_monitor", &self.reporter, async {
                self.cleanup_sessions();
                Ok(())
            })
            .await;
        }

        tracing::debug!("Session monitor stopped");
    }

    /// Evict timed-out and finished sessions. Returns what was evicted.
    pub fn cleanup_sessions(&self) -> Vec<Eviction> {
        let timeout = self.limits.session_timeout;
        let evicted: Vec<Eviction> = {
            let mut table = self.table.write();
            let mut evicted = Vec::new();
            table.sessions.retain(|id, session| {
                let reason = if session.status.is_terminal() {
                    EvictionReason::Finished
                } else if session.started.elapsed() > timeout {
                    EvictionReason::TimedOut
                } else {
                    return true;
                };
                evicted.push(Eviction {
                    session_id: *id,
                    provider: session.provider.clone(),
                    status: match reason {
                        EvictionReason::TimedOut => TranscodeStatus::TimedOut,
                        EvictionReason::Finished => session.status,
                    },
                    reason,
                });
                false
            });
            evicted
        };

        if evicted.is_empty() {
            return evicted;
        }

        for eviction in &evicted {
            match eviction.reason {
                EvictionReason::TimedOut => tracing::warn!(
                    session_id = %eviction.session_id,
                    "Session exceeded timeout, evicted"
                ),
                EvictionReason::Finished => tracing::debug!(
                    session_id = %eviction.session_id,
                    status = %eviction.status,
                    "Finished session evicted"
                ),
            }
            let _ = self.evictions.send(eviction.clone());
        }
        self.capacity.notify_one();
        tracing::info!(
            removed = evicted.len(),
            active_remaining = self.active_sessions(),
            "Cleaned up sessions"
        );
        evicted
    }

    // -- Session reporting ---------------------------------------------------

    /// Record a status change. Terminal statuses stop tracking at once.
    pub fn update_session_status(&self, session_id: SessionId, status: TranscodeStatus) -> Result<()> {
        {
            let mut table = self.table.write();
            let session = table
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            session.status = status;
            session.last_update = Utc::now();
            if !status.is_terminal() {
                return Ok(());
            }
            table.sessions.remove(&session_id);
        }

        tracing::debug!(session_id = %session_id, status = %status, "Session finished, slot freed");
        self.capacity.notify_one();
        Ok(())
    }

    /// Associate an encoder PID with a tracked session.
    pub fn attach_process(&self, session_id: SessionId, pid: i32) -> Result<()> {
        let mut table = self.table.write();
        let session = table
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        if !session.process_ids.contains(&pid) {
            session.process_ids.push(pid);
        }
        session.last_update = Utc::now();
        Ok(())
    }

    pub fn remove_session(&self, session_id: SessionId) -> Option<SessionResource> {
        let removed = self.table.write().sessions.remove(&session_id);
        if removed.is_some() {
            tracing::debug!(session_id = %session_id, "Session removed from tracking");
            self.capacity.notify_one();
        }
        removed
    }

    pub fn session(&self, session_id: SessionId) -> Option<SessionResource> {
        self.table.read().sessions.get(&session_id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn get_resource_usage(&self) -> ResourceUsage {
        let queued_requests = self.queued_requests();
        let table = self.table.read();

        let mut sessions: Vec<SessionSummary> = table
            .sessions
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id,
                media_id: s.media_id.clone(),
                provider: s.provider.clone(),
                status: s.status,
                duration_secs: s.started.elapsed().as_secs(),
                estimated_memory_mb: s.estimated_memory_mb,
            })
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.duration_secs));

        ResourceUsage {
            active_sessions: table.sessions.len(),
            max_concurrent_sessions: self.limits.max_concurrent_sessions,
            queued_requests,
            max_queue_size: self.limits.queue_size,
            total_estimated_memory_mb: sessions.iter().map(|s| s.estimated_memory_mb).sum(),
            sessions,
        }
    }

    /// Advisory memory estimate in MB: a fixed base plus one MB per 100k
    /// output pixels, doubled for HEVC and AV1.
    pub fn estimate_memory_usage(request: &TranscodeRequest) -> u64 {
        let mut estimate = BASE_MEMORY_MB;
        if let Some(resolution) = request.resolution {
            estimate += resolution.pixels() / PIXELS_PER_MB;
        }
        if request.video_codec.as_deref().is_some_and(is_complex_codec) {
            estimate *= 2;
        }
        estimate
    }

    /// Stop background tasks and fail every queued request.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down resource manager");
        self.shutdown.cancel();

        let pending: Vec<QueuedRequest> = self.queue.lock().drain(..).collect();
        for item in pending {
            let _ = item
                .result_tx
                .send(Err(Error::Cancelled("resource manager shutting down".into())));
        }

        let tasks: Vec<SupervisedTask<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let name = task.name().to_string();
            if let Err(e) = task.join().await {
                tracing::warn!(task = %name, error = %e, "Background task ended with error");
            }
        }
    }
}
