//! External process wrapper -- spawn, capture output, wait, kill.
//!
//! A [`ProcessHandle`] owns exactly one OS process. The child is spawned with
//! `kill_on_drop`, so dropping the handle on any path (error, panic, aborted
//! task) destroys the process. Output pipes are drained from inside
//! [`ProcessHandle::wait`], which is cancel-safe and meant to be raced in
//! `tokio::select!` against cancellation and timers.

pub mod capture;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::HarnessError;

pub use capture::Capture;

/// How long to keep reading pipes after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default stdout capture limit (ffprobe JSON for a handful of streams is a few KB).
const DEFAULT_STDOUT_LIMIT: usize = 4 * 1024 * 1024;

const DEFAULT_TAIL_LINES: usize = 20;

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdout_limit: usize,
    pub tail_lines: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            stdout_limit: DEFAULT_STDOUT_LIMIT,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program name for logs and errors.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Lifecycle of the owned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited(ExitStatus),
    Killed(ExitStatus),
}

/// Thin lifecycle wrapper around one external process.
pub struct ProcessHandle {
    spec: ProcessSpec,
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    capture: Capture,
    state: ExitState,
    kill_requested: bool,
    started: Instant,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    pub fn start(spec: &ProcessSpec) -> Result<Self, HarnessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| HarnessError::Launch {
            program: spec.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        debug!(program = %spec.name(), ?pid, "process started");

        Ok(Self {
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            capture: Capture::new(spec.stdout_limit, spec.tail_lines),
            state: ExitState::Running,
            kill_requested: false,
            started: Instant::now(),
            spec: spec.clone(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ExitState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Everything the process wrote to stdout so far.
    pub fn stdout(&self) -> String {
        self.capture.stdout()
    }

    /// Whether stdout went past the capture limit.
    pub fn stdout_truncated(&self) -> bool {
        self.capture.stdout_truncated()
    }

    /// Last lines of output, for diagnostics.
    pub fn output_tail(&self) -> String {
        self.capture.tail()
    }

    /// Wait until the process exits or is killed.
    ///
    /// Cancel-safe: dropping the future loses no output, and calling it again
    /// after exit returns the same status.
    pub async fn wait(&mut self) -> Result<ExitStatus, HarnessError> {
        match self.state {
            ExitState::Exited(status) | ExitState::Killed(status) => return Ok(status),
            ExitState::Running => {}
        }

        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let status = loop {
            tokio::select! {
                n = read_some(&mut self.stdout, &mut out_buf), if self.stdout.is_some() => match n {
                    Ok(0) | Err(_) => self.stdout = None,
                    Ok(n) => self.capture.feed_stdout(&out_buf[..n]),
                },
                n = read_some(&mut self.stderr, &mut err_buf), if self.stderr.is_some() => match n {
                    Ok(0) | Err(_) => self.stderr = None,
                    Ok(n) => self.capture.feed_stderr(&err_buf[..n]),
                },
                status = self.child.wait() => {
                    break status.map_err(|e| {
                        HarnessError::io(format!("wait for {}", self.spec.name()), e)
                    })?;
                }
            }
        };

        self.drain().await;

        self.state = if self.kill_requested {
            ExitState::Killed(status)
        } else {
            ExitState::Exited(status)
        };
        debug!(
            program = %self.spec.name(),
            pid = ?self.pid,
            code = ?status.code(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "process finished"
        );
        Ok(status)
    }

    async fn drain(&mut self) {
        let capture = &mut self.capture;
        let stdout = &mut self.stdout;
        let stderr = &mut self.stderr;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            if let Some(out) = stdout.as_mut() {
                drain_into(out, |b| capture.feed_stdout(b)).await;
            }
            if let Some(err) = stderr.as_mut() {
                drain_into(err, |b| capture.feed_stderr(b)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(program = %self.spec.name(), "output pipes still open after exit, giving up");
        }
        self.stdout = None;
        self.stderr = None;
        self.capture.finish();
    }

    /// Send SIGKILL. Safe to call repeatedly and after the process exited.
    pub fn kill(&mut self) {
        if self.state != ExitState::Running {
            return;
        }
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        self.kill_requested = true;
        if let Err(e) = self.child.start_kill() {
            debug!(program = %self.spec.name(), error = %e, "kill failed, process likely gone");
        }
    }

    /// Ask the process to stop (SIGTERM), escalating to SIGKILL after `grace`.
    ///
    /// Returns once the process has been reaped.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.state != ExitState::Running {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                self.kill_requested = true;
                // SAFETY: pid belongs to our un-reaped child, so it cannot be recycled.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        self.kill();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.spec.name(), code = ?status.code(), "exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(program = %self.spec.name(), error = %e, "error waiting after SIGTERM");
            }
            Err(_) => {
                warn!(program = %self.spec.name(), "no exit after SIGTERM, sending SIGKILL");
                self.kill();
                if let Err(e) = self.wait().await {
                    warn!(program = %self.spec.name(), error = %e, "error waiting after SIGKILL");
                }
            }
        }
    }

    /// Map a non-zero exit to [`HarnessError::ProcessExit`].
    pub fn check(&self, status: ExitStatus) -> Result<(), HarnessError> {
        if status.success() {
            Ok(())
        } else {
            Err(self.exit_error(status, describe_status(status)))
        }
    }

    /// Build an exit error carrying the output tail.
    pub fn exit_error(&self, status: ExitStatus, reason: impl Into<String>) -> HarnessError {
        HarnessError::ProcessExit {
            program: self.spec.name(),
            code: status.code(),
            reason: reason.into(),
            tail: self.capture.tail(),
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn drain_into<R: AsyncRead + Unpin>(reader: &mut R, mut sink: impl FnMut(&[u8])) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => sink(&buf[..n]),
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {}", sig);
        }
    }
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "unknown exit status".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let spec = ProcessSpec::new("/nonexistent/streamcheck-tool", vec![]);
        let err = ProcessHandle::start(&spec).err().expect("spawn must fail");
        assert!(matches!(err, HarnessError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_wait_captures_stdout_and_stderr() {
        let mut handle = ProcessHandle::start(&sh("echo out; echo err 1>&2")).unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(handle.stdout(), "out\n");
        assert_eq!(handle.output_tail(), "err");
        assert_eq!(handle.state(), ExitState::Exited(status));
        // A second wait returns the cached status.
        assert_eq!(handle.wait().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_stdout_over_limit_is_flagged() {
        let mut spec = sh("printf '0123456789'");
        spec.stdout_limit = 4;
        let mut handle = ProcessHandle::start(&spec).unwrap();
        handle.wait().await.unwrap();
        assert_eq!(handle.stdout(), "0123");
        assert!(handle.stdout_truncated());
    }

    #[tokio::test]
    async fn test_non_zero_exit_maps_to_process_exit() {
        let mut handle = ProcessHandle::start(&sh("echo boom 1>&2; exit 3")).unwrap();
        let status = handle.wait().await.unwrap();
        match handle.check(status) {
            Err(HarnessError::ProcessExit { code, tail, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(tail, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut handle = ProcessHandle::start(&sh("sleep 30")).unwrap();
        handle.kill();
        handle.kill();
        let status = handle.wait().await.unwrap();
        assert!(!status.success());
        assert!(matches!(handle.state(), ExitState::Killed(_)));
        handle.kill();
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let mut handle = ProcessHandle::start(&sh("true")).unwrap();
        let status = handle.wait().await.unwrap();
        handle.kill();
        assert_eq!(handle.state(), ExitState::Exited(status));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut handle = ProcessHandle::start(&sh("trap '' TERM; sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        handle.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(handle.state(), ExitState::Killed(_)));
    }

    #[tokio::test]
    async fn test_wait_is_cancel_safe() {
        let mut handle = ProcessHandle::start(&sh("echo first; sleep 0.3; echo second")).unwrap();
        let raced = tokio::time::timeout(Duration::from_millis(100), handle.wait()).await;
        assert!(raced.is_err());
        handle.wait().await.unwrap();
        assert_eq!(handle.stdout(), "first\nsecond\n");
    }
}
