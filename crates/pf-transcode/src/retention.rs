//! Retention of finished sessions and their output.
//!
//! Each sweep runs three passes over the output root:
//!
//! 1. finished sessions older than the retention window are removed from the
//!    store, and their directory with them once no remaining session uses it;
//! 2. session and content directories no session owns are removed after a
//!    grace period;
//! 3. when a size cap is set and exceeded, the oldest finished sessions are
//!    evicted until the root is back under 90% of the cap.
//!
//! Running sessions and their directories are never touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use pf_core::config::CleanupConfig;
use pf_core::report::ErrorReporter;
use pf_core::task::{guard, spawn_supervised, SupervisedTask};
use pf_core::{Error, Result, SessionId};

use crate::output::OutputLayout;
use crate::store::{SessionRecord, SessionStore};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub retention: Duration,
    pub max_total_bytes: Option<u64>,
    pub orphan_grace: Duration,
    pub interval: Duration,
}

impl From<&CleanupConfig> for RetentionPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            retention: config.retention(),
            max_total_bytes: config.max_size_bytes(),
            orphan_grace: config.orphan_grace(),
            interval: config.interval(),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub expired_sessions: usize,
    pub orphaned_dirs: usize,
    /// Sessions removed to get under the size cap.
    pub evicted_sessions: usize,
    pub bytes_freed: u64,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.expired_sessions == 0 && self.orphaned_dirs == 0 && self.evicted_sessions == 0
    }
}

pub struct RetentionSweeper {
    store: Arc<dyn SessionStore>,
    layout: OutputLayout,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn SessionStore>, layout: OutputLayout, policy: RetentionPolicy) -> Self {
        Self {
            store,
            layout,
            policy,
        }
    }

    /// Run every pass once.
    pub async fn sweep(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        self.expire_sessions(&mut report).await?;
        self.remove_orphans(&mut report).await?;
        if let Some(limit) = self.policy.max_total_bytes {
            self.enforce_size_cap(limit, &mut report).await?;
        }

        if !report.is_empty() {
            tracing::info!(
                expired = report.expired_sessions,
                orphaned = report.orphaned_dirs,
                evicted = report.evicted_sessions,
                bytes_freed = report.bytes_freed,
                "Retention sweep removed output"
            );
        }
        Ok(report)
    }

    /// [`sweep`](Self::sweep) every interval until `cancel` fires. Failures
    /// are reported and the next tick tries again.
    pub fn start(
        self: Arc<Self>,
        reporter: Arc<ErrorReporter>,
        cancel: CancellationToken,
    ) -> SupervisedTask<()> {
        let task_reporter = Arc::clone(&reporter);

        spawn_supervised("retention_sweeper", reporter, async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                guard("retention_sweeper", &task_reporter, self.sweep()).await;
            }

            tracing::debug!("Retention sweeper stopped");
            Ok(())
        })
    }

    fn output_dir(&self, record: &SessionRecord) -> PathBuf {
        record.directory_path.clone().unwrap_or_else(|| {
            self.layout
                .session_dir(&record.request.container, &record.provider, record.session_id)
        })
    }

    fn is_expired(&self, record: &SessionRecord) -> bool {
        if !record.status.is_terminal() {
            return false;
        }
        record
            .end_time
            .and_then(|end| (Utc::now() - end).to_std().ok())
            .is_some_and(|age| age >= self.policy.retention)
    }

    async fn expire_sessions(&self, report: &mut RetentionReport) -> Result<()> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .store
            .list()
            .await?
            .into_iter()
            .partition(|r| self.is_expired(r));
        let in_use: HashSet<PathBuf> = kept.iter().map(|r| self.output_dir(r)).collect();

        for record in expired {
            self.store.remove(record.session_id).await?;
            report.expired_sessions += 1;

            let dir = self.output_dir(&record);
            if !in_use.contains(&dir) {
                report.bytes_freed += remove_dir(&dir).await?;
            }
            tracing::debug!(session_id = %record.session_id, "Expired finished session");
        }
        Ok(())
    }

    async fn remove_orphans(&self, report: &mut RetentionReport) -> Result<()> {
        let records = self.store.list().await?;
        let sessions: HashSet<SessionId> = records.iter().map(|r| r.session_id).collect();
        let hashes: HashSet<&str> = records.iter().filter_map(|r| r.content_hash.as_deref()).collect();

        let session_dirs = list_dirs(&self.layout.sessions_root()).await?;
        let content_dirs = list_dirs(&self.layout.contents_root()).await?;

        let orphans = session_dirs
            .into_iter()
            .filter(|(name, _)| {
                // Only directories following the session naming scheme.
                session_id_from_dir_name(name).is_some_and(|id| !sessions.contains(&id))
            })
            .chain(content_dirs.into_iter().filter(|(name, _)| !hashes.contains(name.as_str())));

        for (_, path) in orphans {
            if newest_change_age(&path).await? < self.policy.orphan_grace {
                continue;
            }
            report.bytes_freed += remove_dir(&path).await?;
            report.orphaned_dirs += 1;
            tracing::info!(path = %path.display(), "Removed orphaned output directory");
        }
        Ok(())
    }

    async fn enforce_size_cap(&self, limit: u64, report: &mut RetentionReport) -> Result<()> {
        let mut current = dir_size(self.layout.root()).await?;
        if current <= limit {
            return Ok(());
        }
        let target = limit / 10 * 9;
        tracing::warn!(current, limit, "Output exceeds size cap, evicting oldest sessions");

        let records = self.store.list().await?;
        let live: HashSet<PathBuf> = records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| self.output_dir(r))
            .collect();
        let mut finished: Vec<&SessionRecord> = records.iter().filter(|r| r.status.is_terminal()).collect();
        finished.sort_by_key(|r| r.end_time.unwrap_or(r.start_time));

        let mut handled = HashSet::new();
        for record in &finished {
            if current <= target {
                break;
            }
            let dir = self.output_dir(record);
            if live.contains(&dir) || !handled.insert(dir.clone()) {
                continue;
            }
            // Every session sharing the directory goes with it.
            for owner in finished.iter().filter(|r| self.output_dir(r) == dir) {
                self.store.remove(owner.session_id).await?;
                report.evicted_sessions += 1;
            }
            let freed = remove_dir(&dir).await?;
            current = current.saturating_sub(freed);
            report.bytes_freed += freed;
        }

        if current > target {
            tracing::warn!(current, target, "Size cap still exceeded; only running sessions remain");
        }
        Ok(())
    }
}

/// Session ID from a `<container>_<provider>_<session uuid>` directory name.
pub fn session_id_from_dir_name(name: &str) -> Option<SessionId> {
    name.rsplit_once('_').and_then(|(_, id)| id.parse().ok())
}

/// `(name, path)` of every directory directly below `root`. A missing root
/// has none.
async fn list_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(dirs)
}

/// Remove `dir` and return the bytes it held. Already gone is not an error.
async fn remove_dir(dir: &Path) -> Result<u64> {
    let size = dir_size(dir).await?;
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::Storage(format!("remove {}: {e}", dir.display()))),
    }
}

async fn dir_size(dir: &Path) -> Result<u64> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum::<u64>()
    })
    .await
    .map_err(|e| Error::Internal(format!("size task failed: {e}")))
}

/// Time since anything below `dir` (the directory included) last changed.
///
/// A long encode writes into one file, so the directory's own mtime alone
/// can be far older than the output.
async fn newest_change_age(dir: &Path) -> Result<Duration> {
    let dir = dir.to_path_buf();
    let newest = tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok()?.modified().ok())
            .max()
    })
    .await
    .map_err(|e| Error::Internal(format!("mtime task failed: {e}")))?;

    Ok(newest
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .unwrap_or(Duration::ZERO))
}
