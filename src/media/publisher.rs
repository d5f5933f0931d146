//! Publisher -- loops a sample file into the server under test with ffmpeg.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::{CancelCause, Canceller, Fire, ReadinessSignal, RunContext};
use crate::error::HarnessError;
use crate::process::{ProcessHandle, ProcessSpec};

/// Output container written to the destination URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// RTMP ingest.
    Flv,
    /// SRT ingest.
    MpegTs,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Flv => "flv",
            OutputFormat::MpegTs => "mpegts",
        }
    }
}

/// What to publish and where.
#[derive(Debug, Clone)]
pub struct PublishSpec {
    pub input: PathBuf,
    pub destination: String,
    pub format: OutputFormat,
    /// Read the input at its native frame rate (`-re`).
    pub realtime: bool,
    /// Loop the input forever (`-stream_loop -1`).
    pub loop_input: bool,
}

impl PublishSpec {
    pub fn new(input: impl Into<PathBuf>, destination: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            input: input.into(),
            destination: destination.into(),
            format,
            realtime: true,
            loop_input: true,
        }
    }

    /// ffmpeg arguments: read the input, copy codecs, write to the destination.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.realtime {
            args.push("-re".to_string());
        }
        if self.loop_input {
            args.extend(["-stream_loop".to_string(), "-1".to_string()]);
        }
        args.extend([
            "-i".to_string(),
            self.input.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            self.format.as_str().to_string(),
            self.destination.clone(),
        ]);
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Idle,
    Starting,
    Running,
    Cancelled,
    Exited,
}

/// Runs one publishing process for the lifetime of a scope.
pub struct Publisher {
    tool: PathBuf,
    spec: PublishSpec,
    grace: Duration,
    state: watch::Sender<PublisherState>,
    ready_fire: Fire,
    ready: RunContext,
}

impl Publisher {
    pub fn new(tool: impl Into<PathBuf>, spec: PublishSpec, grace: Duration) -> Self {
        let (ready_fire, ready) = ReadinessSignal::new();
        let (state, _) = watch::channel(PublisherState::Idle);
        Self {
            tool: tool.into(),
            spec,
            grace,
            state,
            ready_fire,
            ready,
        }
    }

    pub fn spec(&self) -> &PublishSpec {
        &self.spec
    }

    /// Completes once the process is alive and has had its grace period to
    /// start writing output.
    pub fn ready(&self) -> RunContext {
        self.ready.clone()
    }

    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    /// Publish until `ctx` is cancelled or the process exits.
    ///
    /// Blocks for the process lifetime, so callers run it in its own task.
    /// Cancellation is the normal way out and yields the context's cause as an
    /// error, which the aggregation drops. Any exit of the process counts as
    /// unexpected since the input loops forever. `cancel` fires when this
    /// returns, on every path.
    pub async fn run(&self, ctx: &RunContext, cancel: Canceller) -> Result<(), HarnessError> {
        let _cancel = cancel.cancel_on_drop();

        let mut started = false;
        self.state.send_if_modified(|s| {
            if *s == PublisherState::Idle {
                *s = PublisherState::Starting;
                started = true;
            }
            started
        });
        if !started {
            return Err(HarnessError::AlreadyStarted { what: "publisher" });
        }

        let spec = ProcessSpec::new(&self.tool, self.spec.args());
        info!(command = %spec.command_line(), "starting publisher");
        let mut handle = match ProcessHandle::start(&spec) {
            Ok(h) => h,
            Err(e) => {
                self.state.send_replace(PublisherState::Exited);
                return Err(e);
            }
        };

        // Grace period: the process has to survive it before we call it ready.
        tokio::select! {
            _ = ctx.done() => return Err(self.stop(&mut handle, ctx).await),
            status = handle.wait() => return Err(self.exited(&handle, status)),
            _ = tokio::time::sleep(self.grace) => {}
        }

        self.state.send_replace(PublisherState::Running);
        self.ready_fire.fire();
        info!(pid = ?handle.pid(), destination = %self.spec.destination, "publisher ready");

        tokio::select! {
            _ = ctx.done() => Err(self.stop(&mut handle, ctx).await),
            status = handle.wait() => Err(self.exited(&handle, status)),
        }
    }

    async fn stop(&self, handle: &mut ProcessHandle, ctx: &RunContext) -> HarnessError {
        handle.kill();
        if let Err(e) = handle.wait().await {
            warn!(error = %e, "failed to reap publisher");
        }
        self.state.send_replace(PublisherState::Cancelled);
        let cause = ctx.err().unwrap_or(CancelCause::Cancelled);
        debug!(?cause, elapsed_ms = handle.elapsed().as_millis() as u64, "publisher stopped");
        cause.into()
    }

    fn exited(
        &self,
        handle: &ProcessHandle,
        status: Result<std::process::ExitStatus, HarnessError>,
    ) -> HarnessError {
        self.state.send_replace(PublisherState::Exited);
        match status {
            Ok(status) => {
                let err = handle.exit_error(status, "publisher exited unexpectedly");
                warn!(error = %err, "publisher exited");
                err
            }
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flv_args() {
        let spec = PublishSpec::new("source.flv", "rtmp://localhost/live/s1?secret=x", OutputFormat::Flv);
        assert_eq!(
            spec.args(),
            vec![
                "-re", "-stream_loop", "-1", "-i", "source.flv", "-c", "copy", "-f", "flv",
                "rtmp://localhost/live/s1?secret=x",
            ]
        );
    }

    #[test]
    fn test_mpegts_args_without_loop() {
        let mut spec = PublishSpec::new("in.ts", "srt://localhost:10080?streamid=#!::r=live/s1,m=publish", OutputFormat::MpegTs);
        spec.loop_input = false;
        spec.realtime = false;
        let args = spec.args();
        assert_eq!(args[0], "-i");
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "mpegts"));
    }

    #[test]
    fn test_new_publisher_is_idle() {
        let spec = PublishSpec::new("in.flv", "rtmp://x/live/s", OutputFormat::Flv);
        let publisher = Publisher::new("ffmpeg", spec, Duration::from_millis(10));
        assert_eq!(publisher.state(), PublisherState::Idle);
        assert!(!publisher.ready().is_done());
    }

    #[tokio::test]
    async fn test_missing_tool_is_launch_error() {
        let spec = PublishSpec::new("in.flv", "rtmp://x/live/s", OutputFormat::Flv);
        let publisher = Publisher::new("/nonexistent/ffmpeg", spec, Duration::from_millis(10));
        let scope = RunContext::background().with_cancel();
        let err = publisher.run(&scope, scope.canceller()).await.unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }));
        assert_eq!(publisher.state(), PublisherState::Exited);
        // The exit hook fired.
        assert!(scope.is_done());
    }
}
