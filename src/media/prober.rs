//! Prober -- records a live stream to a side file, then inspects it.
//!
//! Recording is done by `ffmpeg -t <secs> -i <url> -c copy -y <dvr>`, which
//! connects to the server, retries on its own while the stream is not yet
//! available, and stops by itself after the duration budget. The recorded
//! file is then inspected with `ffprobe`, whose JSON becomes the
//! [`ProbeResult`].
//!
//! The probe-done signal is separate from the caller's scope: it fires when a
//! result is available, whether or not the caller chooses to stop publishing.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{CancelCause, Canceller, Fire, ReadinessSignal, RunContext};
use crate::error::HarnessError;
use crate::media::model::{ProbeResult, ProbeSnapshot};
use crate::media::MediaTools;
use crate::process::{ProcessHandle, ProcessSpec};

/// Grace given to the recorder on SIGTERM so it can finalize the file.
const RECORDER_STOP_GRACE: Duration = Duration::from_secs(3);

/// Shortest `-t` handed to the recorder.
const MIN_RECORD_SECS: f64 = 0.1;

/// What to probe and for how long.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub stream_url: String,
    pub dvr_file: PathBuf,
    /// How much of the stream to record.
    pub duration: Duration,
    /// Upper bound for the whole probe, recording retries included.
    pub timeout: Duration,
    /// Wait between recording attempts when the recorder fails.
    pub retry_interval: Duration,
    /// Once the duration budget is spent, stop the recorder if the file did
    /// not grow for this long.
    pub stall_window: Duration,
    /// Upper bound for the ffprobe inspection.
    pub inspect_timeout: Duration,
}

impl ProbeSpec {
    pub fn new(stream_url: impl Into<String>, dvr_file: impl Into<PathBuf>, duration: Duration, timeout: Duration) -> Self {
        Self {
            stream_url: stream_url.into(),
            dvr_file: dvr_file.into(),
            duration,
            timeout,
            retry_interval: Duration::from_secs(3),
            stall_window: Duration::from_secs(3),
            inspect_timeout: Duration::from_secs(10),
        }
    }

    fn record_args(&self) -> Vec<String> {
        vec![
            "-t".to_string(),
            format!("{:.3}", self.duration.as_secs_f64().max(MIN_RECORD_SECS)),
            "-i".to_string(),
            self.stream_url.clone(),
            "-c".to_string(),
            "copy".to_string(),
            "-y".to_string(),
            self.dvr_file.display().to_string(),
        ]
    }

    fn inspect_args(&self) -> Vec<String> {
        vec![
            "-show_error".to_string(),
            "-show_private_data".to_string(),
            "-v".to_string(),
            "quiet".to_string(),
            "-find_stream_info".to_string(),
            "-analyzeduration".to_string(),
            self.duration.as_micros().to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            self.dvr_file.display().to_string(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberState {
    Idle,
    Probing,
    Done,
}

/// How the recording phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recording {
    /// The recorder stopped by itself after the duration budget.
    Completed,
    /// The file stopped growing after the budget; the recorder was stopped.
    Stalled,
    /// The probe's own timeout hit.
    TimedOut,
    /// The caller's scope finished.
    Aborted(CancelCause),
}

pub struct Prober {
    tools: MediaTools,
    spec: ProbeSpec,
    state: watch::Sender<ProberState>,
    done_fire: Fire,
    done: RunContext,
    snapshot: OnceLock<ProbeSnapshot>,
}

impl Prober {
    pub fn new(tools: MediaTools, spec: ProbeSpec) -> Self {
        let (done_fire, done) = ReadinessSignal::new();
        let (state, _) = watch::channel(ProberState::Idle);
        Self {
            tools,
            spec,
            state,
            done_fire,
            done,
            snapshot: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    pub fn state(&self) -> ProberState {
        *self.state.borrow()
    }

    /// Fires once a result is available (or the probe gave up).
    pub fn done(&self) -> RunContext {
        self.done.clone()
    }

    /// Raw ffprobe output and its parsed form.
    ///
    /// Meaningful after [`Prober::run`] returned or [`Prober::done`] fired;
    /// empty before that. Repeated calls return the same value.
    pub fn result(&self) -> (String, ProbeResult) {
        match self.snapshot.get() {
            Some(s) => (s.raw.clone(), s.result.clone()),
            None => (String::new(), ProbeResult::default()),
        }
    }

    /// Record and inspect the stream.
    ///
    /// Bounded by `min(spec.timeout, ctx deadline)`. Whatever ends the
    /// recording, the captured file is inspected and the result stored before
    /// this returns and before probe-done fires. `cancel` fires on return.
    /// A recorder that cannot be launched fails the run at once with
    /// [`HarnessError::Launch`]; the stored result is then empty.
    pub async fn run(&self, ctx: &RunContext, cancel: Canceller) -> Result<(), HarnessError> {
        let _cancel = cancel.cancel_on_drop();

        let mut started = false;
        self.state.send_if_modified(|s| {
            if *s == ProberState::Idle {
                *s = ProberState::Probing;
                started = true;
            }
            started
        });
        if !started {
            return Err(HarnessError::AlreadyStarted { what: "prober" });
        }
        let _done = self.done_fire.fire_on_drop();

        let probe_ctx = ctx.with_timeout(self.spec.timeout);
        let started_at = Instant::now();
        info!(
            url = %self.spec.stream_url,
            dvr = %self.spec.dvr_file.display(),
            duration_ms = self.spec.duration.as_millis() as u64,
            timeout_ms = self.spec.timeout.as_millis() as u64,
            "starting probe"
        );

        let recording = self.record_with_retry(ctx, &probe_ctx).await;
        debug!(?recording, elapsed_ms = started_at.elapsed().as_millis() as u64, "recording finished");

        let inspected = match recording {
            Ok(_) => self.inspect().await,
            Err(_) => Ok(ProbeSnapshot::default()),
        };
        let (snapshot, inspect_err) = match inspected {
            Ok(snapshot) => (snapshot, None),
            Err(e) => (ProbeSnapshot::default(), Some(e)),
        };
        let streams = snapshot.result.streams.len();
        info!(
            streams,
            score = snapshot.result.score(),
            duration_ms = snapshot.result.duration().as_millis() as u64,
            "probe done"
        );
        let _ = self.snapshot.set(snapshot);
        self.state.send_replace(ProberState::Done);
        self.done_fire.fire();

        let recording = recording?;
        if let Some(e) = inspect_err {
            return Err(e);
        }
        match recording {
            Recording::Aborted(cause) => Err(cause.into()),
            Recording::TimedOut if streams == 0 => Err(HarnessError::Timeout {
                what: format!("probe of {}", self.spec.stream_url),
                after: self.spec.timeout,
            }),
            Recording::TimedOut => {
                warn!(streams, "probe timed out, using what was recorded");
                Ok(())
            }
            Recording::Completed | Recording::Stalled => Ok(()),
        }
    }

    /// Record until one attempt ends the phase. A recorder that cannot be
    /// launched at all is fatal and comes back as the error.
    async fn record_with_retry(
        &self,
        ctx: &RunContext,
        probe_ctx: &RunContext,
    ) -> Result<Recording, HarnessError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.record(probe_ctx).await {
                Ok(recording) => return Ok(recording),
                Err(e @ HarnessError::Launch { .. }) => return Err(e),
                Err(e) => {
                    if let Some(stopped) = stopped_by(ctx, probe_ctx) {
                        return Ok(stopped);
                    }
                    warn!(attempt, error = %e, "recorder failed, retrying");
                }
            }

            tokio::select! {
                _ = probe_ctx.done() => {
                    return Ok(stopped_by(ctx, probe_ctx).unwrap_or(Recording::TimedOut));
                }
                _ = tokio::time::sleep(self.spec.retry_interval) => {}
            }
        }
    }

    async fn record(&self, probe_ctx: &RunContext) -> Result<Recording, HarnessError> {
        if let Err(e) = tokio::fs::remove_file(&self.spec.dvr_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(HarnessError::io(
                    format!("remove {}", self.spec.dvr_file.display()),
                    e,
                ));
            }
        }

        let spec = ProcessSpec::new(&self.tools.ffmpeg, self.spec.record_args());
        debug!(command = %spec.command_line(), "starting recorder");
        let mut handle = ProcessHandle::start(&spec)?;
        let recording_started = Instant::now();

        let mut ticker = tokio::time::interval(self.spec.stall_window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_size: u64 = 0;

        loop {
            tokio::select! {
                _ = probe_ctx.done() => {
                    handle.terminate(RECORDER_STOP_GRACE).await;
                    return Err(probe_ctx.err().unwrap_or(CancelCause::Cancelled).into());
                }
                status = handle.wait() => {
                    handle.check(status?)?;
                    return Ok(Recording::Completed);
                }
                _ = ticker.tick() => {
                    let size = file_size(&self.spec.dvr_file).await;
                    let budget_spent = recording_started.elapsed() >= self.spec.duration;
                    if budget_spent && size > 0 && size == last_size {
                        info!(size, "recording stalled after duration budget, stopping recorder");
                        handle.terminate(RECORDER_STOP_GRACE).await;
                        return Ok(Recording::Stalled);
                    }
                    last_size = size;
                }
            }
        }
    }

    async fn inspect(&self) -> Result<ProbeSnapshot, HarnessError> {
        if file_size(&self.spec.dvr_file).await == 0 {
            debug!(dvr = %self.spec.dvr_file.display(), "nothing recorded, skipping inspection");
            return Ok(ProbeSnapshot::default());
        }

        let spec = ProcessSpec::new(&self.tools.ffprobe, self.spec.inspect_args());
        debug!(command = %spec.command_line(), "starting inspection");
        let mut handle = ProcessHandle::start(&spec)?;

        // Detached from the caller's scope so a cancelled run still parses
        // what it recorded.
        let status = match tokio::time::timeout(self.spec.inspect_timeout, handle.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                handle.kill();
                let _ = handle.wait().await;
                return Err(HarnessError::Timeout {
                    what: format!("ffprobe of {}", self.spec.dvr_file.display()),
                    after: self.spec.inspect_timeout,
                });
            }
        };

        let raw = handle.stdout();
        if handle.stdout_truncated() {
            warn!(bytes = raw.len(), "ffprobe output truncated, result will be incomplete");
        }
        let result = ProbeResult::parse_lenient(&raw);
        let snapshot = ProbeSnapshot { raw, result };
        handle.check(status)?;
        Ok(snapshot)
    }
}

/// Which scope ended the recording, if any: the caller's scope wins over the
/// probe's own timeout.
fn stopped_by(ctx: &RunContext, probe_ctx: &RunContext) -> Option<Recording> {
    if let Some(cause) = ctx.err() {
        return Some(Recording::Aborted(cause));
    }
    probe_ctx.err().map(|_| Recording::TimedOut)
}

async fn file_size(path: &std::path::Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
