//! Bounded in-memory log of background failures.
//!
//! Background loops never hand errors to a caller; they hand them to an
//! [`ErrorReporter`], which logs them through `tracing` and keeps the most
//! recent ones for diagnostics.

use std::any::Any;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::ids::ReportId;

/// Default number of retained reports.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One captured failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub id: ReportId,
    pub timestamp: DateTime<Utc>,
    /// Component or task that hit the failure.
    pub origin: String,
    pub kind: ErrorKind,
    pub recoverable: bool,
    pub message: String,
    pub session_id: Option<String>,
    /// Stack captured at the panic site, for recovered panics.
    pub stack: Option<String>,
}

/// Thread-safe, bounded error log. The oldest report is dropped when full.
pub struct ErrorReporter {
    capacity: usize,
    reports: RwLock<VecDeque<ErrorReport>>,
}

impl ErrorReporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reports: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    /// Log and retain an error raised by `origin`.
    pub fn report(&self, origin: &str, err: &Error) {
        let recoverable = err.is_recoverable();
        let session_id = err.session_id().map(str::to_owned);

        if recoverable {
            tracing::warn!(origin, session_id = ?session_id, "Recoverable background error: {err}");
        } else {
            tracing::error!(origin, session_id = ?session_id, "Background error: {err}");
        }

        let stack = match err.root() {
            Error::Panic { stack, .. } => stack.clone(),
            _ => None,
        };

        self.push(ErrorReport {
            id: ReportId::new(),
            timestamp: Utc::now(),
            origin: origin.to_owned(),
            kind: err.kind(),
            recoverable,
            message: err.to_string(),
            session_id,
            stack,
        });
    }

    /// Convert a caught panic payload into an [`Error::Panic`], record it and
    /// return it so the caller can surface it as a structured result.
    pub fn report_panic(
        &self,
        task: &str,
        payload: Box<dyn Any + Send>,
        stack: Option<String>,
    ) -> Error {
        let err = Error::Panic {
            task: task.to_owned(),
            message: panic_message(payload.as_ref()),
            stack,
        };
        self.report(task, &err);
        err
    }

    /// The `n` most recent reports, newest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorReport> {
        self.reports.read().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }

    pub fn clear(&self) {
        self.reports.write().clear();
    }

    fn push(&self, report: ErrorReport) {
        if self.capacity == 0 {
            return;
        }
        let mut reports = self.reports.write();
        while reports.len() >= self.capacity {
            reports.pop_front();
        }
        reports.push_back(report);
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<Error>() {
        err.to_string()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn report_records_kind_and_recoverability() {
        let reporter = ErrorReporter::new(10);
        reporter.report(
            "queue_worker",
            &Error::QueueFull {
                capacity: 1,
                retry_after: Duration::from_secs(1),
            },
        );
        reporter.report("sweeper", &Error::Unkillable { pid: 7 });

        let recent = reporter.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].origin, "sweeper");
        assert_eq!(recent[0].kind, ErrorKind::Transcode);
        assert!(!recent[0].recoverable);
        assert_eq!(recent[1].kind, ErrorKind::Resource);
        assert!(recent[1].recoverable);
    }

    #[test]
    fn capacity_drops_oldest() {
        let reporter = ErrorReporter::new(3);
        for i in 0..5 {
            reporter.report("t", &Error::Internal(format!("e{i}")));
        }
        assert_eq!(reporter.len(), 3);
        let messages: Vec<_> = reporter.recent(3).into_iter().map(|r| r.message).collect();
        assert_eq!(
            messages,
            vec!["Internal error: e4", "Internal error: e3", "Internal error: e2"]
        );
    }

    #[test]
    fn session_id_is_extracted() {
        let reporter = ErrorReporter::default();
        reporter.report(
            "monitor",
            &Error::Internal("lost".into()).with_session("abc"),
        );
        assert_eq!(reporter.recent(1)[0].session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn report_panic_converts_payload() {
        let reporter = ErrorReporter::default();
        let err = reporter.report_panic(
            "worker",
            Box::new(String::from("exploded")),
            Some("frame 0".into()),
        );
        assert_eq!(err.to_string(), "Panic in worker: exploded");
        let report = &reporter.recent(1)[0];
        assert_eq!(report.kind, ErrorKind::Internal);
        assert_eq!(report.stack.as_deref(), Some("frame 0"));
    }

    #[test]
    fn panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic payload");
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let reporter = ErrorReporter::new(0);
        reporter.report("t", &Error::Internal("x".into()));
        assert!(reporter.is_empty());
        reporter.clear();
    }
}
