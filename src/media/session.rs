//! StreamSession -- runs a publisher and a prober side by side.
//!
//! The session owns a scope derived from the caller's context and a
//! [`TaskGroup`] holding one unit per media process. Under
//! [`TerminationPolicy::FastQuit`] the scope is cancelled as soon as the probe
//! is done, and each unit cancels it when it returns. Under
//! [`TerminationPolicy::ObserveThenStop`] the units get detached cancellers,
//! so publishing goes on after the probe until the caller calls
//! [`StreamSession::stop`].
//!
//! ```text
//!   ctx ──with_cancel──► scope ──► publisher unit ─┐
//!                          │                      ├─► TaskGroup::join
//!                          └────► prober unit ────┘
//!                                   │
//!                                   └─► probe-done ──► (FastQuit) scope.cancel()
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::{CancelCause, Canceller, RunContext};
use crate::error::HarnessError;
use crate::media::model::{ProbeResult, ProbeSnapshot};
use crate::media::prober::{ProbeSpec, Prober, ProberState};
use crate::media::publisher::{PublishSpec, Publisher, PublisherState};
use crate::media::MediaTools;
use crate::task::{GroupOutcome, TaskGroup};

/// How the session ends once the probe produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Stop everything as soon as the probe is done.
    FastQuit,
    /// Keep publishing after the probe; the caller stops the session.
    ObserveThenStop,
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    /// `None` when the server publishes on its own (virtual live).
    pub publish: Option<PublishSpec>,
    pub publish_grace: Duration,
    pub probe: ProbeSpec,
    pub policy: TerminationPolicy,
    /// Start probing only after the publisher is ready plus this delay.
    pub probe_after_ready: Option<Duration>,
}

impl SessionPlan {
    pub fn new(publish: Option<PublishSpec>, probe: ProbeSpec) -> Self {
        Self {
            publish,
            publish_grace: Duration::from_millis(500),
            probe,
            policy: TerminationPolicy::FastQuit,
            probe_after_ready: None,
        }
    }

    pub fn policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn probe_after_ready(mut self, delay: Duration) -> Self {
        self.probe_after_ready = Some(delay);
        self
    }
}

/// How [`StreamSession::wait_probe`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeWait {
    /// The probe produced its result.
    Done,
    /// The scope finished before the probe could run.
    Aborted(CancelCause),
}

pub struct StreamSession {
    scope: RunContext,
    policy: TerminationPolicy,
    publisher: Option<Arc<Publisher>>,
    prober: Arc<Prober>,
    group: TaskGroup,
}

impl StreamSession {
    /// Spawn the publisher (if any) and the prober under a scope derived from
    /// `ctx`. Must be called inside a tokio runtime.
    pub fn launch(ctx: &RunContext, tools: &MediaTools, plan: SessionPlan) -> Self {
        let scope = ctx.with_cancel();
        let mut group = TaskGroup::new();
        let exit_hook = || match plan.policy {
            TerminationPolicy::FastQuit => scope.canceller(),
            TerminationPolicy::ObserveThenStop => Canceller::detached(),
        };

        info!(
            policy = ?plan.policy,
            publish = ?plan.publish.as_ref().map(|p| p.destination.as_str()),
            probe = %plan.probe.stream_url,
            "launching stream session"
        );

        let publisher = plan.publish.map(|spec| {
            let publisher = Arc::new(Publisher::new(&tools.ffmpeg, spec, plan.publish_grace));
            let unit = Arc::clone(&publisher);
            let unit_scope = scope.clone();
            let cancel = exit_hook();
            group.spawn("publish", async move { unit.run(&unit_scope, cancel).await });
            publisher
        });

        let prober = Arc::new(Prober::new(tools.clone(), plan.probe));
        let unit = Arc::clone(&prober);
        let unit_scope = scope.clone();
        let cancel = exit_hook();
        let gate = match (plan.probe_after_ready, &publisher) {
            (Some(delay), Some(p)) => Some((p.ready(), p.subscribe(), delay)),
            _ => None,
        };
        group.spawn("probe", async move {
            if let Some((ready, states, delay)) = gate {
                let stopped = publisher_stopped(states);
                tokio::pin!(stopped);
                tokio::select! {
                    _ = unit_scope.done() => {
                        let _cancel = cancel.cancel_on_drop();
                        return Err(unit_scope.err().unwrap_or(CancelCause::Cancelled).into());
                    }
                    _ = &mut stopped => {
                        // Nothing left to probe; end the session whatever the policy.
                        debug!("publisher stopped before it was ready, not probing");
                        let _cancel = cancel.cancel_on_drop();
                        unit_scope.cancel();
                        return Err(HarnessError::Cancelled);
                    }
                    _ = ready.done() => {}
                }
                debug!(delay_ms = delay.as_millis() as u64, "publisher ready, delaying probe");
                tokio::select! {
                    _ = unit_scope.done() => {
                        let _cancel = cancel.cancel_on_drop();
                        return Err(unit_scope.err().unwrap_or(CancelCause::Cancelled).into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            unit.run(&unit_scope, cancel).await
        });

        Self {
            scope,
            policy: plan.policy,
            publisher,
            prober,
            group,
        }
    }

    pub fn scope(&self) -> &RunContext {
        &self.scope
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    pub fn publisher_state(&self) -> Option<PublisherState> {
        self.publisher.as_ref().map(|p| p.state())
    }

    pub fn prober_state(&self) -> ProberState {
        self.prober.state()
    }

    /// Completes once the publisher is ready; `None` without a publisher.
    pub fn publisher_ready(&self) -> Option<RunContext> {
        self.publisher.as_ref().map(|p| p.ready())
    }

    /// Wait for probe-done, or for the scope to finish first.
    ///
    /// When the scope finishes while the probe is running, this still waits
    /// for the prober to store its result, so [`StreamSession::result`] is
    /// settled on return either way. Under fast-quit the scope is cancelled
    /// once the probe is done.
    pub async fn wait_probe(&self) -> ProbeWait {
        let probe_done = self.prober.done();
        let outcome = tokio::select! {
            biased;
            _ = probe_done.done() => ProbeWait::Done,
            _ = self.scope.done() => {
                if self.prober.state() == ProberState::Idle {
                    ProbeWait::Aborted(self.scope.err().unwrap_or(CancelCause::Cancelled))
                } else {
                    probe_done.done().await;
                    ProbeWait::Done
                }
            }
        };
        debug!(?outcome, "probe wait finished");

        if self.policy == TerminationPolicy::FastQuit {
            self.scope.cancel();
        }
        outcome
    }

    /// The prober's raw output and parsed result.
    pub fn result(&self) -> (String, ProbeResult) {
        self.prober.result()
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        let (raw, result) = self.prober.result();
        ProbeSnapshot { raw, result }
    }

    /// Cancel the session scope; the units stop their processes.
    pub fn stop(&self) {
        self.scope.cancel();
    }

    /// Stop and join every unit, returning what each of them reported.
    pub async fn shutdown(mut self) -> GroupOutcome {
        self.scope.cancel();
        let outcome = self.group.join().await;
        for (unit, err) in &outcome.units {
            debug!(unit = %unit, error = ?err.as_ref().map(|e| e.to_string()), "unit joined");
        }
        outcome
    }
}

/// Completes once the publisher reached a terminal state (or is gone).
async fn publisher_stopped(mut states: watch::Receiver<PublisherState>) {
    let _ = states
        .wait_for(|s| matches!(s, PublisherState::Cancelled | PublisherState::Exited))
        .await;
}

/// Run a fast-quit session to completion.
///
/// Returns the probe snapshot and the per-unit outcome; the caller filters
/// the outcome against its own context.
pub async fn probe_stream(
    ctx: &RunContext,
    tools: &MediaTools,
    plan: SessionPlan,
) -> (ProbeSnapshot, GroupOutcome) {
    let session = StreamSession::launch(ctx, tools, plan.policy(TerminationPolicy::FastQuit));
    session.wait_probe().await;
    let snapshot = session.snapshot();
    let outcome = session.shutdown().await;
    (snapshot, outcome)
}

/// Check the three stream properties every media case asserts.
///
/// `min_score` is skipped when `None` (HLS scores low by nature).
pub fn check_stream(
    result: &ProbeResult,
    raw: &str,
    expected_streams: usize,
    min_score: Option<i32>,
    probe_duration: Duration,
) -> Vec<HarnessError> {
    let mut errors = Vec::new();
    if result.streams.len() != expected_streams {
        errors.push(HarnessError::assertion(format!(
            "invalid streams={}, {}, {}",
            result.streams.len(),
            result,
            raw
        )));
    }
    if let Some(threshold) = min_score {
        if result.score() < threshold {
            errors.push(HarnessError::assertion(format!(
                "low score={} < {}, {}, {}",
                result.score(),
                threshold,
                result,
                raw
            )));
        }
    }
    let floor = probe_duration / 2;
    if result.duration() < floor {
        errors.push(HarnessError::assertion(format!(
            "short duration={:?} < {:?}, {}, {}",
            result.duration(),
            floor,
            result,
            raw
        )));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::model::{ProbeFormat, ProbeStream};

    fn two_tracks(score: i32, duration: &str) -> ProbeResult {
        ProbeResult {
            streams: vec![
                ProbeStream {
                    codec_type: "video".into(),
                    codec_name: "h264".into(),
                    ..Default::default()
                },
                ProbeStream {
                    index: 1,
                    codec_type: "audio".into(),
                    codec_name: "aac".into(),
                    ..Default::default()
                },
            ],
            format: ProbeFormat {
                probe_score: score,
                duration: duration.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_check_stream_passes() {
        let errors = check_stream(&two_tracks(100, "4.011"), "", 2, Some(90), Duration::from_millis(4000));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_check_stream_reports_each_property() {
        let errors = check_stream(&ProbeResult::default(), "{}", 2, Some(90), Duration::from_millis(4000));
        assert_eq!(errors.len(), 3);
        assert!(errors[0].to_string().starts_with("invalid streams=0"));
        assert!(errors[1].to_string().starts_with("low score=0 < 90"));
        assert!(errors[2].to_string().starts_with("short duration="));
    }

    #[test]
    fn test_check_stream_skips_score_for_hls() {
        let errors = check_stream(&two_tracks(51, "2.56"), "", 2, None, Duration::from_millis(4000));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_plan_defaults_to_fast_quit() {
        let plan = SessionPlan::new(
            None,
            ProbeSpec::new("http://x/live/s.flv", "dvr.flv", Duration::from_secs(4), Duration::from_secs(30)),
        );
        assert_eq!(plan.policy, TerminationPolicy::FastQuit);
        assert!(plan.probe_after_ready.is_none());
        let plan = plan.probe_after_ready(Duration::from_secs(3));
        assert_eq!(plan.probe_after_ready, Some(Duration::from_secs(3)));
    }
}
