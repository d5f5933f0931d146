//! Cancellation scopes and one-shot readiness signals.
//!
//! A [`RunContext`] is a cancellable scope with an optional deadline. It is
//! cheap to clone, every clone observes the same scope, and child scopes are
//! cancelled together with their parent. Unlike a bare
//! [`CancellationToken`], a context remembers *why* it finished, which is what
//! lets the error aggregation drop intentional cancellations while still
//! reporting a test that ran out of time.
//!
//! A [`ReadinessSignal`] is the same primitive used as a broadcast event: the
//! [`Fire`] half completes the context, any number of tasks wait on it.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`RunContext`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Cancelled,
    DeadlineExceeded,
}

struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<CancelCause>,
    parent: Option<RunContext>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Releases the deadline timer task, if any.
        self.token.cancel();
    }
}

/// Cancellable, optionally deadline-bounded scope.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl RunContext {
    /// Root scope: never cancelled unless [`RunContext::cancel`] is called.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Child scope that can be cancelled on its own.
    pub fn with_cancel(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Child scope that also finishes after `timeout`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child scope finishing at `deadline` or at the parent's deadline,
    /// whichever comes first.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.inner.deadline {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };
        let child = self.derive(Some(effective));
        if self.inner.deadline != Some(effective) {
            spawn_deadline_timer(Arc::downgrade(&child.inner), child.inner.token.clone(), effective);
        }
        child
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this scope and every scope derived from it. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            let _ = self.inner.cause.set(CancelCause::Cancelled);
        }
        self.inner.token.cancel();
    }

    /// Completes when the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        self.inner.token.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason this scope finished, `None` while it is still live.
    pub fn err(&self) -> Option<CancelCause> {
        if !self.inner.token.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }
        if let Some(parent) = &self.inner.parent {
            if let Some(cause) = parent.err() {
                return Some(cause);
            }
        }
        Some(CancelCause::Cancelled)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` for scopes without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// A handle that cancels this scope.
    pub fn canceller(&self) -> Canceller {
        Canceller { ctx: self.clone() }
    }
}

fn spawn_deadline_timer(inner: Weak<Inner>, token: CancellationToken, deadline: Instant) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(inner) = inner.upgrade() {
                    if !inner.token.is_cancelled() {
                        let _ = inner.cause.set(CancelCause::DeadlineExceeded);
                    }
                    inner.token.cancel();
                }
            }
        }
    });
}

/// Cancels one [`RunContext`]; handed to a unit of work as its exit hook.
#[derive(Clone, Debug)]
pub struct Canceller {
    ctx: RunContext,
}

impl Canceller {
    /// A canceller bound to a private scope nobody observes.
    ///
    /// Units given this keep the caller's scope alive after they finish,
    /// which is how the observe-then-stop policy keeps publishing after the
    /// probe is done.
    pub fn detached() -> Self {
        RunContext::background().canceller()
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Cancel when the returned guard drops, on any exit path.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            canceller: self.clone(),
        }
    }
}

pub struct CancelOnDrop {
    canceller: Canceller,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

/// One-shot, multi-waiter completion signal.
pub struct ReadinessSignal;

impl ReadinessSignal {
    /// Returns the trigger and the context that completes when it fires.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Fire, RunContext) {
        let ctx = RunContext::background().with_cancel();
        (Fire { ctx: ctx.clone() }, ctx)
    }
}

/// Trigger half of a [`ReadinessSignal`]. Firing more than once is a no-op.
#[derive(Clone, Debug)]
pub struct Fire {
    ctx: RunContext,
}

impl Fire {
    pub fn fire(&self) {
        self.ctx.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.ctx.is_done()
    }

    /// Fire when the returned guard drops.
    pub fn fire_on_drop(&self) -> FireOnDrop {
        FireOnDrop { fire: self.clone() }
    }
}

pub struct FireOnDrop {
    fire: Fire,
}

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.fire.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_live() {
        let ctx = RunContext::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.deadline(), None);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = RunContext::background().with_cancel();
        let child = parent.with_cancel();
        parent.cancel();
        child.done().await;
        assert_eq!(child.err(), Some(CancelCause::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_live() {
        let parent = RunContext::background().with_cancel();
        let child = parent.with_cancel();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(100));
        assert_eq!(ctx.err(), None);
        ctx.done().await;
        assert_eq!(ctx.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_inherits_earlier_parent_deadline() {
        let parent = RunContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
        child.done().await;
        assert_eq!(child.err(), Some(CancelCause::DeadlineExceeded));
        assert!(parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline_keeps_cancel_cause() {
        let ctx = RunContext::background().with_timeout(Duration::from_secs(5));
        ctx.cancel();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ctx.err(), Some(CancelCause::Cancelled));
    }

    #[tokio::test]
    async fn test_signal_fires_for_every_waiter() {
        let (fire, ctx) = ReadinessSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.done().await })
            })
            .collect();
        fire.fire();
        fire.fire();
        for w in waiters {
            w.await.unwrap();
        }
        // Late waiters return immediately.
        ctx.done().await;
        assert!(fire.is_fired());
    }

    #[tokio::test]
    async fn test_cancel_on_drop_guard() {
        let ctx = RunContext::background().with_cancel();
        {
            let _guard = ctx.canceller().cancel_on_drop();
        }
        assert_eq!(ctx.err(), Some(CancelCause::Cancelled));
    }

    #[tokio::test]
    async fn test_detached_canceller_does_not_touch_caller() {
        let ctx = RunContext::background().with_cancel();
        Canceller::detached().cancel();
        assert!(!ctx.is_done());
    }
}
