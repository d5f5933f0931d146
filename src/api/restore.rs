//! Scoped server-side settings and bounded polling.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::context::{CancelCause, RunContext};
use crate::error::HarnessError;

type RestoreFn = Box<dyn FnOnce(RunContext) -> BoxFuture<'static, Result<(), HarnessError>> + Send>;

/// Puts a server-side setting back the way a case found it.
///
/// Call [`Restore::run`] on the way out. If the guard is dropped instead
/// (early return, panic, aborted task), the action is spawned onto the
/// runtime. Either way it runs under a fresh context bounded by its own
/// timeout, since the case context is usually finished by then.
pub struct Restore {
    what: String,
    timeout: Duration,
    action: Option<RestoreFn>,
}

impl Restore {
    pub fn new<F, Fut>(what: impl Into<String>, timeout: Duration, action: F) -> Self
    where
        F: FnOnce(RunContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HarnessError>> + Send + 'static,
    {
        Self {
            what: what.into(),
            timeout,
            action: Some(Box::new(move |ctx| action(ctx).boxed())),
        }
    }

    pub fn what(&self) -> &str {
        &self.what
    }

    /// Run the restore now and report how it went.
    pub async fn run(mut self) -> Result<(), HarnessError> {
        match self.action.take() {
            Some(action) => restore(&self.what, self.timeout, action).await,
            None => Ok(()),
        }
    }

    /// Drop the action without running it.
    pub fn disarm(mut self) {
        self.action = None;
    }
}

impl Drop for Restore {
    fn drop(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };
        let what = self.what.clone();
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%what, "restore guard dropped, restoring in background");
                handle.spawn(async move {
                    let _ = restore(&what, timeout, action).await;
                });
            }
            Err(_) => warn!(%what, "no runtime to restore setting on"),
        }
    }
}

async fn restore(what: &str, timeout: Duration, action: RestoreFn) -> Result<(), HarnessError> {
    let ctx = RunContext::background().with_timeout(timeout);
    let result = action(ctx).await;
    match &result {
        Ok(()) => info!(%what, "setting restored"),
        Err(e) => warn!(%what, error = %e, "restore failed"),
    }
    result
}

/// Call `probe` up to `attempts` times, `interval` apart, until it yields a
/// value.
///
/// `Ok(None)` and errors both mean "not yet"; the last error is returned when
/// the attempts run out, a [`HarnessError::Timeout`] otherwise. `ctx`
/// cancellation ends the wait early with its cause.
pub async fn poll_until<T, F, Fut>(
    ctx: &RunContext,
    what: &str,
    attempts: u32,
    interval: Duration,
    mut probe: F,
) -> Result<T, HarnessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, HarnessError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match probe().await {
            Ok(Some(v)) => {
                debug!(%what, attempt, "condition met");
                return Ok(v);
            }
            Ok(None) => debug!(%what, attempt, "condition not met yet"),
            Err(e) if e.is_cancellation() || matches!(e, HarnessError::DeadlineExceeded) => return Err(e),
            Err(e) => {
                debug!(%what, attempt, error = %e, "poll attempt failed");
                last_err = Some(e);
            }
        }
        if attempt == attempts {
            break;
        }
        tokio::select! {
            _ = ctx.done() => return Err(ctx.err().unwrap_or(CancelCause::Cancelled).into()),
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Err(last_err.unwrap_or_else(|| HarnessError::Timeout {
        what: what.to_string(),
        after: interval * attempts.saturating_sub(1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_on_third_attempt() {
        let ctx = RunContext::background();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let got = poll_until(&ctx, "flag", 5, Duration::from_secs(1), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= 3 { Some(n) } else { None })
        })
        .await
        .unwrap();
        assert_eq!(got, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let ctx = RunContext::background();
        let err = poll_until(&ctx, "flag", 3, Duration::from_secs(1), || async { Ok(None::<()>) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_last_error() {
        let ctx = RunContext::background();
        let err = poll_until(&ctx, "flag", 2, Duration::from_secs(1), || async {
            Err::<Option<()>, _>(HarnessError::assertion("still off"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "still off");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_on_cancel() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(1500));
        let err = poll_until(&ctx, "flag", 100, Duration::from_secs(1), || async { Ok(None::<()>) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_restore_runs_with_fresh_context() {
        let case_ctx = RunContext::background().with_cancel();
        case_ctx.cancel();
        let restored = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&restored);
        let guard = Restore::new("title", Duration::from_secs(5), move |ctx| async move {
            assert!(!ctx.is_done());
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        guard.run().await.unwrap();
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_on_drop_spawns() {
        let restored = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&restored);
        {
            let _guard = Restore::new("flag", Duration::from_secs(5), move |_ctx| async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        for _ in 0..50 {
            if restored.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disarmed_restore_never_runs() {
        let restored = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&restored);
        let guard = Restore::new("flag", Duration::from_secs(5), move |_ctx| async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        guard.disarm();
        tokio::task::yield_now().await;
        assert_eq!(restored.load(Ordering::SeqCst), 0);
    }
}

impl std::fmt::Debug for Restore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restore")
            .field("what", &self.what)
            .field("timeout", &self.timeout)
            .field("armed", &self.action.is_some())
            .finish()
    }
}
