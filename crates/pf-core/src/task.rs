//! Supervised background tasks.
//!
//! A supervised task runs a future behind an unwind boundary. Errors and
//! panics are handed to the [`ErrorReporter`] instead of tearing down the
//! runtime worker, and the outcome is available as a structured [`Result`]
//! through [`SupervisedTask::join`].

use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::report::ErrorReporter;

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install (once per process) a panic hook that stashes the panic-site
/// backtrace for [`take_panic_stack`], then defers to the previous hook.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = std::backtrace::Backtrace::force_capture().to_string();
            LAST_PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Take the backtrace captured by the most recent panic on this thread.
pub fn take_panic_stack() -> Option<String> {
    LAST_PANIC_STACK.with(|slot| slot.borrow_mut().take())
}

/// Run `fut` behind an unwind boundary. A panic is converted into
/// [`Error::Panic`] and reported; ordinary errors pass through unreported.
pub async fn catch_panic<F, T>(name: &str, reporter: &ErrorReporter, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    install_panic_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(reporter.report_panic(name, payload, take_panic_stack())),
    }
}

/// Like [`catch_panic`] but also reports ordinary errors. Returns `None` on
/// any failure so a loop body can simply continue.
pub async fn guard<F, T>(name: &str, reporter: &ErrorReporter, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match catch_panic(name, reporter, fut).await {
        Ok(value) => Some(value),
        Err(Error::Panic { .. }) => None,
        Err(e) => {
            reporter.report(name, &e);
            None
        }
    }
}

/// Handle to a task started with [`spawn_supervised`].
pub struct SupervisedTask<T> {
    name: String,
    handle: JoinHandle<Result<T>>,
}

impl<T> SupervisedTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the task and return its structured outcome.
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled(format!("task {} aborted", self.name))),
            Err(e) => Err(Error::Internal(format!("task {} failed to join: {e}", self.name))),
        }
    }
}

/// Spawn `fut` on the tokio runtime under supervision.
///
/// Failures (including panics) are reported to `reporter` and also returned
/// from [`SupervisedTask::join`].
pub fn spawn_supervised<F, T>(
    name: impl Into<String>,
    reporter: Arc<ErrorReporter>,
    fut: F,
) -> SupervisedTask<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let result = catch_panic(&task_name, &reporter, fut).await;
        if let Err(ref e) = result {
            if !matches!(e, Error::Panic { .. }) {
                reporter.report(&task_name, e);
            }
        }
        result
    });
    SupervisedTask { name, handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_task_returns_value() {
        let reporter = Arc::new(ErrorReporter::default());
        let task = spawn_supervised("adder", reporter.clone(), async { Ok(2 + 2) });
        assert_eq!(task.join().await.unwrap(), 4);
        assert!(reporter.is_empty());
    }

    #[tokio::test]
    async fn failing_task_is_reported() {
        let reporter = Arc::new(ErrorReporter::default());
        let task = spawn_supervised("failer", reporter.clone(), async {
            Err::<(), _>(Error::Internal("nope".into()))
        });
        let err = task.join().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(reporter.len(), 1);
        assert_eq!(reporter.recent(1)[0].origin, "failer");
    }

    #[tokio::test]
    async fn panicking_task_becomes_structured_error() {
        let reporter = Arc::new(ErrorReporter::default());
        let task = spawn_supervised("panicker", reporter.clone(), async {
            if should_panic() {
                panic!("worker exploded");
            }
            Ok(())
        });
        let err = task.join().await.unwrap_err();
        match err {
            Error::Panic {
                task,
                message,
                stack,
            } => {
                assert_eq!(task, "panicker");
                assert_eq!(message, "worker exploded");
                assert!(stack.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(reporter.len(), 1);
    }

    #[tokio::test]
    async fn guard_swallows_failures() {
        let reporter = ErrorReporter::default();
        let ok = guard("tick", &reporter, async { Ok(1) }).await;
        assert_eq!(ok, Some(1));

        let failed: Option<()> =
            guard("tick", &reporter, async { Err(Error::Timeout("slow".into())) }).await;
        assert!(failed.is_none());

        let panicked: Option<()> = guard("tick", &reporter, async {
            if should_panic() {
                panic!("tick panicked");
            }
            Ok(())
        })
        .await;
        assert!(panicked.is_none());
        assert_eq!(reporter.len(), 2);
    }

    #[tokio::test]
    async fn aborted_task_reports_cancelled() {
        let reporter = Arc::new(ErrorReporter::default());
        let task = spawn_supervised("sleeper", reporter, async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        });
        task.abort();
        assert!(matches!(task.join().await, Err(Error::Cancelled(_))));
    }

    fn should_panic() -> bool {
        true
    }
}
