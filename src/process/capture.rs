//! Bounded capture of a child's stdout and stderr.

use std::collections::VecDeque;

/// Longest stderr line kept; ffmpeg progress lines end in `\r` and can run on.
const MAX_LINE_BYTES: usize = 2048;

/// Captured output of one process.
///
/// Stdout is kept whole up to a byte limit (it carries machine-readable
/// output such as ffprobe's JSON). Stderr keeps only its last lines, which is
/// what a failure report needs.
#[derive(Debug)]
pub struct Capture {
    stdout: Vec<u8>,
    stdout_limit: usize,
    stdout_truncated: bool,
    stderr_tail: VecDeque<String>,
    tail_lines: usize,
    partial: Vec<u8>,
}

impl Capture {
    pub fn new(stdout_limit: usize, tail_lines: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stdout_limit,
            stdout_truncated: false,
            stderr_tail: VecDeque::with_capacity(tail_lines),
            tail_lines: tail_lines.max(1),
            partial: Vec::new(),
        }
    }

    pub fn feed_stdout(&mut self, bytes: &[u8]) {
        let room = self.stdout_limit.saturating_sub(self.stdout.len());
        if bytes.len() > room {
            self.stdout_truncated = true;
        }
        self.stdout.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn feed_stderr(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.flush_line();
            } else if self.partial.len() < MAX_LINE_BYTES {
                self.partial.push(b);
            }
        }
    }

    /// Flush a trailing stderr line that had no terminator.
    pub fn finish(&mut self) {
        self.flush_line();
    }

    fn flush_line(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        if line.is_empty() {
            return;
        }
        if self.stderr_tail.len() == self.tail_lines {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stdout_truncated(&self) -> bool {
        self.stdout_truncated
    }

    /// Last stderr lines, or the end of stdout when stderr was silent.
    pub fn tail(&self) -> String {
        if !self.stderr_tail.is_empty() {
            return self
                .stderr_tail
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n");
        }
        let text = self.stdout();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(self.tail_lines);
        lines[start..].join("\n")
    }
}
