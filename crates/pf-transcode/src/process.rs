//! Encoder process supervision.
//!
//! Providers register every OS process they spawn. The supervisor can then
//! terminate a session's process group with SIGTERM → SIGKILL escalation and
//! periodically sweeps entries whose process died or overstayed the hard
//! runtime ceiling.
//!
//! Liveness is a zero-signal probe. A PID recycled by the OS after the
//! encoder exited will read as alive until the next sweep notices the entry's
//! age. That race is accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use pf_core::config::ProcessConfig;
use pf_core::events::{EventBus, EventCategory, EventPayload};
use pf_core::report::ErrorReporter;
use pf_core::task::{guard, spawn_supervised, SupervisedTask};
use pf_core::{Error, Result, SessionId};

/// A tracked encoder process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub session_id: SessionId,
    pub provider: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip)]
    started: Instant,
}

impl ProcessInfo {
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Outcome of one [`ProcessSupervisor::cleanup_orphaned`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Entries dropped because their process no longer exists.
    pub removed_dead: Vec<i32>,
    /// Processes force-killed for exceeding the runtime ceiling.
    pub killed: Vec<i32>,
    /// Processes that survived the kill escalation.
    pub failed: Vec<i32>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed_dead.is_empty() && self.killed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    by_pid: HashMap<i32, ProcessInfo>,
    by_session: HashMap<SessionId, i32>,
}

impl Inner {
    fn remove(&mut self, pid: i32) -> Option<ProcessInfo> {
        let info = self.by_pid.remove(&pid)?;
        if self.by_session.get(&info.session_id) == Some(&pid) {
            self.by_session.remove(&info.session_id);
        }
        Some(info)
    }
}

/// Registry of encoder processes plus the termination logic.
pub struct ProcessSupervisor {
    inner: RwLock<Inner>,
    config: ProcessConfig,
    events: Option<Arc<EventBus>>,
}

impl ProcessSupervisor {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
            events: None,
        }
    }

    /// Publish [`EventPayload::ProcessKilled`] on `bus` for every kill.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Track `pid` as the encoder for `session_id`.
    ///
    /// A session may own only one live process. Registering a second PID
    /// while the first is still alive fails; a dead predecessor is replaced.
    pub fn register(&self, pid: i32, session_id: SessionId, provider: &str) -> Result<()> {
        if pid <= 0 {
            return Err(Error::Validation(format!("invalid pid {pid}")));
        }

        let mut inner = self.inner.write();
        if let Some(&existing) = inner.by_session.get(&session_id) {
            if existing != pid {
                if sys::is_alive(existing) {
                    return Err(Error::Validation(format!(
                        "session {session_id} already has live process {existing}"
                    ))
                    .with_session(session_id));
                }
                inner.remove(existing);
            }
        }
        // A reused PID replaces whatever stale entry held it.
        inner.remove(pid);

        inner.by_pid.insert(
            pid,
            ProcessInfo {
                pid,
                session_id,
                provider: provider.to_string(),
                start_time: Utc::now(),
                started: Instant::now(),
            },
        );
        inner.by_session.insert(session_id, pid);
        drop(inner);

        tracing::info!(pid, session_id = %session_id, provider, "Registered encoder process");
        Ok(())
    }

    pub fn unregister(&self, pid: i32) -> Option<ProcessInfo> {
        let removed = self.inner.write().remove(pid);
        if let Some(ref info) = removed {
            tracing::debug!(pid, session_id = %info.session_id, "Unregistered encoder process");
        }
        removed
    }

    pub fn get(&self, pid: i32) -> Option<ProcessInfo> {
        self.inner.read().by_pid.get(&pid).cloned()
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.inner.read().by_pid.values().cloned().collect()
    }

    pub fn processes_for_session(&self, session_id: SessionId) -> Vec<ProcessInfo> {
        let inner = self.inner.read();
        inner
            .by_session
            .get(&session_id)
            .and_then(|pid| inner.by_pid.get(pid))
            .cloned()
            .into_iter()
            .collect()
    }

    pub fn processes_for_provider(&self, provider: &str) -> Vec<ProcessInfo> {
        self.inner
            .read()
            .by_pid
            .values()
            .filter(|p| p.provider == provider)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_pid.is_empty()
    }

    /// Whether `pid` refers to a running (non-zombie) process.
    pub fn is_process_alive(pid: i32) -> bool {
        sys::is_alive(pid)
    }

    /// Terminate `pid` and its process group.
    ///
    /// SIGTERM, then wait up to the graceful window; SIGKILL, then wait up
    /// to the forced window. A process that is already gone is `Ok`. One that
    /// survives both windows yields [`Error::Unkillable`]. Does not touch the
    /// registry.
    pub async fn kill_process_group(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(Error::Validation(format!("invalid pid {pid}")));
        }
        if !sys::is_alive(pid) {
            return Ok(());
        }

        let group = sys::group_of(pid);

        sys::terminate(pid, group, false);
        if self.wait_for_exit(pid, self.config.graceful_kill()).await {
            tracing::debug!(pid, "Process exited after SIGTERM");
            return Ok(());
        }

        tracing::warn!(pid, "Process did not terminate gracefully, sending SIGKILL");
        sys::terminate(pid, group, true);
        if self.wait_for_exit(pid, self.config.forced_kill()).await {
            return Ok(());
        }

        tracing::error!(pid, "Process survived SIGKILL");
        Err(Error::Unkillable { pid })
    }

    async fn wait_for_exit(&self, pid: i32, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if !sys::is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Kill the process owned by `session_id` and drop its entry.
    ///
    /// Returns `false` when the session had no tracked process.
    pub async fn kill_session(&self, session_id: SessionId) -> Result<bool> {
        let pid = self.inner.read().by_session.get(&session_id).copied();
        let Some(pid) = pid else {
            return Ok(false);
        };

        self.kill_process_group(pid)
            .await
            .map_err(|e| e.with_session(session_id))?;
        self.unregister(pid);
        self.announce_kill(pid, session_id);
        Ok(true)
    }

    /// Sweep the registry once.
    ///
    /// Entries whose process is gone are removed. Processes older than the
    /// runtime ceiling are killed regardless of what their session reports.
    /// The registry lock is released before any signal is sent.
    pub async fn cleanup_orphaned(&self) -> CleanupReport {
        let snapshot = self.processes();
        let max_runtime = self.config.max_runtime();
        let mut report = CleanupReport::default();

        for info in snapshot {
            if !sys::is_alive(info.pid) {
                self.unregister(info.pid);
                report.removed_dead.push(info.pid);
                continue;
            }

            if info.age() > max_runtime {
                tracing::warn!(
                    pid = info.pid,
                    session_id = %info.session_id,
                    age_secs = info.age().as_secs(),
                    "Encoder exceeded runtime ceiling, killing"
                );
                match self.kill_process_group(info.pid).await {
                    Ok(()) => {
                        self.unregister(info.pid);
                        self.announce_kill(info.pid, info.session_id);
                        report.killed.push(info.pid);
                    }
                    Err(_) => report.failed.push(info.pid),
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                removed = report.removed_dead.len(),
                killed = report.killed.len(),
                failed = report.failed.len(),
                "Process sweep finished"
            );
        }
        report
    }

    /// Kill every tracked process. Used at shutdown.
    pub async fn kill_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for info in self.processes() {
            match self.kill_process_group(info.pid).await {
                Ok(()) => {
                    self.unregister(info.pid);
                    report.killed.push(info.pid);
                }
                Err(_) => report.failed.push(info.pid),
            }
        }
        report
    }

    /// Run [`cleanup_orphaned`](Self::cleanup_orphaned) every sweep interval
    /// until `cancel` fires. Unkillable processes are reported, never raised.
    pub fn start_sweeper(
        self: &Arc<Self>,
        reporter: Arc<ErrorReporter>,
        cancel: CancellationToken,
    ) -> SupervisedTask<()> {
        let supervisor = Arc::clone(self);
        let task_reporter = Arc::clone(&reporter);

        spawn_supervised("process_sweeper", reporter, async move {
            let mut interval = tokio::time::interval(supervisor.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let sweep = guard("process_sweeper", &task_reporter, async {
                    Ok(supervisor.cleanup_orphaned().await)
                })
                .await;

                for pid in sweep.map(|r| r.failed).unwrap_or_default() {
                    task_reporter.report("process_sweeper", &Error::Unkillable { pid });
                }
            }

            tracing::debug!("Process sweeper stopped");
            Ok(())
        })
    }

    fn announce_kill(&self, pid: i32, session_id: SessionId) {
        if let Some(bus) = &self.events {
            bus.broadcast(
                EventCategory::System,
                EventPayload::ProcessKilled { pid, session_id },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Platform layer
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    pub fn is_alive(pid: i32) -> bool {
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => !is_zombie(pid),
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: i32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        // "<pid> (<comm>) <state> ..."; comm may itself contain ')'.
        stat.rfind(')')
            .and_then(|i| stat[i + 1..].trim_start().chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X')
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: i32) -> bool {
        false
    }

    /// The process group to signal, unless it is our own.
    pub fn group_of(pid: i32) -> Option<i32> {
        let pgid = getpgid(Some(Pid::from_raw(pid))).ok()?;
        (pgid != getpgrp()).then(|| pgid.as_raw())
    }

    pub fn terminate(pid: i32, group: Option<i32>, force: bool) {
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if let Some(pgid) = group {
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                tracing::debug!(pid, pgid, error = %e, "Signalling process group failed");
            }
        }
        if let Err(e) = kill(Pid::from_raw(pid), signal) {
            tracing::debug!(pid, error = %e, "Signalling process failed");
        }
    }
}

#[cfg(not(unix))]
mod sys {
    pub fn is_alive(_pid: i32) -> bool {
        false
    }

    pub fn group_of(_pid: i32) -> Option<i32> {
        None
    }

    pub fn terminate(_pid: i32, _group: Option<i32>, _force: bool) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fast_config() -> ProcessConfig {
        ProcessConfig {
            graceful_kill_ms: 300,
            forced_kill_ms: 2000,
            poll_interval_ms: 20,
            max_runtime_secs: 1800,
            sweep_interval_secs: 60,
        }
    }

    /// Spawn `sh -c script` in its own process group with a reaper task so
    /// the child never lingers as a zombie.
    fn spawn_sh(script: &str) -> i32 {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .spawn()
            .expect("spawn sh");
        let pid = child.id().expect("pid") as i32;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        pid
    }

    #[tokio::test]
    #[serial]
    async fn kill_exited_pid_is_ok() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let pid = spawn_sh("exit 0");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ProcessSupervisor::is_process_alive(pid));
        supervisor.kill_process_group(pid).await.unwrap();
        supervisor.kill_process_group(pid).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn sigterm_stops_cooperative_process() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let pid = spawn_sh("sleep 30");
        assert!(ProcessSupervisor::is_process_alive(pid));

        let started = Instant::now();
        supervisor.kill_process_group(pid).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!ProcessSupervisor::is_process_alive(pid));
    }

    #[tokio::test]
    #[serial]
    async fn escalates_to_sigkill_when_term_is_ignored() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let pid = spawn_sh("trap '' TERM; sleep 30; sleep 30");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        supervisor.kill_process_group(pid).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!ProcessSupervisor::is_process_alive(pid));
    }

    #[tokio::test]
    #[serial]
    async fn one_live_process_per_session() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let session = SessionId::new();
        let first = spawn_sh("sleep 30");
        let second = spawn_sh("sleep 30");

        supervisor.register(first, session, "ffmpeg").unwrap();
        assert!(matches!(
            supervisor.register(second, session, "ffmpeg"),
            Err(Error::Context { .. })
        ));
        assert_eq!(supervisor.processes_for_session(session)[0].pid, first);

        assert!(supervisor.kill_session(session).await.unwrap());
        assert!(supervisor.processes_for_session(session).is_empty());
        assert!(!supervisor.kill_session(session).await.unwrap());

        // With the first process gone the session can take a new one.
        supervisor.register(second, session, "ffmpeg").unwrap();
        supervisor.kill_session(session).await.unwrap();
    }

    #[test]
    fn rejects_invalid_pid() {
        let supervisor = ProcessSupervisor::new(fast_config());
        assert!(supervisor.register(0, SessionId::new(), "x").is_err());
        assert!(supervisor.register(-5, SessionId::new(), "x").is_err());
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn sweep_removes_dead_and_kills_overdue() {
        let mut config = fast_config();
        config.max_runtime_secs = 0;
        let supervisor = ProcessSupervisor::new(config);

        let dead = spawn_sh("exit 0");
        let stuck = spawn_sh("sleep 30");
        tokio::time::sleep(Duration::from_millis(200)).await;

        supervisor.register(dead, SessionId::new(), "ffmpeg").unwrap();
        supervisor.register(stuck, SessionId::new(), "other").unwrap();
        assert_eq!(supervisor.processes_for_provider("other").len(), 1);

        let report = supervisor.cleanup_orphaned().await;
        assert_eq!(report.removed_dead, vec![dead]);
        assert_eq!(report.killed, vec![stuck]);
        assert!(report.failed.is_empty());
        assert!(supervisor.is_empty());
        assert!(!ProcessSupervisor::is_process_alive(stuck));
    }

    #[tokio::test]
    #[serial]
    async fn sweep_leaves_young_processes() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let pid = spawn_sh("sleep 30");
        supervisor.register(pid, SessionId::new(), "ffmpeg").unwrap();

        let report = supervisor.cleanup_orphaned().await;
        assert!(report.is_empty());
        assert_eq!(supervisor.len(), 1);

        let report = supervisor.kill_all().await;
        assert_eq!(report.killed, vec![pid]);
    }

    #[tokio::test]
    #[serial]
    async fn kill_session_publishes_event() {
        let bus = Arc::new(EventBus::default());
        let supervisor = ProcessSupervisor::new(fast_config()).with_events(Arc::clone(&bus));
        let session = SessionId::new();
        let pid = spawn_sh("sleep 30");
        supervisor.register(pid, session, "ffmpeg").unwrap();

        supervisor.kill_session(session).await.unwrap();
        let events = bus.recent_events(1);
        assert!(matches!(
            events[0].payload,
            EventPayload::ProcessKilled { pid: p, session_id } if p == pid && session_id == session
        ));
    }
}
