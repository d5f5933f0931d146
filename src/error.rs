//! Error taxonomy shared by the process layer, the media units and the cases.

use std::time::Duration;

use thiserror::Error;

use crate::context::CancelCause;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?} ({reason}): {tail}")]
    ProcessExit {
        program: String,
        code: Option<i32>,
        reason: String,
        tail: String,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Cancelled,

    #[error("{what} already started")]
    AlreadyStarted { what: &'static str },

    #[error("api {path} returned code {code}: {body}")]
    Api { path: String, code: i64, body: String },

    #[error("http request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Assertion(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate: {0}")]
    Cert(#[from] rcgen::Error),

    #[error("task {name} did not finish: {message}")]
    Join { name: String, message: String },

    #[error("{first}, with {}", .rest.join(", "))]
    Aggregate {
        first: Box<HarnessError>,
        rest: Vec<String>,
    },
}

impl HarnessError {
    pub fn assertion(msg: impl Into<String>) -> Self {
        HarnessError::Assertion(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HarnessError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the error a unit returns when its scope was cancelled on purpose.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HarnessError::Cancelled)
    }

    /// True when this error is the same condition as a context's own cause.
    pub fn matches_cause(&self, cause: CancelCause) -> bool {
        match cause {
            CancelCause::Cancelled => matches!(self, HarnessError::Cancelled),
            CancelCause::DeadlineExceeded => matches!(self, HarnessError::DeadlineExceeded),
        }
    }
}

impl From<CancelCause> for HarnessError {
    fn from(cause: CancelCause) -> Self {
        match cause {
            CancelCause::Cancelled => HarnessError::Cancelled,
            CancelCause::DeadlineExceeded => HarnessError::DeadlineExceeded,
        }
    }
}

/// Combine the context's own error with the per-slot errors of a run.
///
/// Plain cancellations never surface: a fast-quit stops the other units on
/// purpose and they all report `Cancelled`. When the context itself ran out of
/// time, that is reported once and the units echoing it are dropped.
pub fn filter_test_error(
    ctx_cause: Option<CancelCause>,
    errors: impl IntoIterator<Item = HarnessError>,
) -> Option<HarnessError> {
    let mut kept: Vec<HarnessError> = Vec::new();

    if let Some(CancelCause::DeadlineExceeded) = ctx_cause {
        kept.push(HarnessError::DeadlineExceeded);
    }

    for err in errors {
        if err.is_cancellation() {
            continue;
        }
        if let Some(cause) = ctx_cause {
            if err.matches_cause(cause) {
                continue;
            }
        }
        kept.push(err);
    }

    let mut iter = kept.into_iter();
    let first = iter.next()?;
    let rest: Vec<String> = iter
        .enumerate()
        .map(|(i, e)| format!("err #{}, {}", i, e))
        .collect();
    if rest.is_empty() {
        Some(first)
    } else {
        Some(HarnessError::Aggregate {
            first: Box::new(first),
            rest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellations_are_dropped() {
        let err = filter_test_error(
            Some(CancelCause::Cancelled),
            vec![HarnessError::Cancelled, HarnessError::Cancelled],
        );
        assert!(err.is_none());
    }

    #[test]
    fn test_cancellation_dropped_without_ctx_cause() {
        assert!(filter_test_error(None, vec![HarnessError::Cancelled]).is_none());
    }

    #[test]
    fn test_deadline_reported_once() {
        let err = filter_test_error(
            Some(CancelCause::DeadlineExceeded),
            vec![HarnessError::DeadlineExceeded, HarnessError::DeadlineExceeded],
        )
        .expect("deadline must surface");
        assert!(matches!(err, HarnessError::DeadlineExceeded));
    }

    #[test]
    fn test_single_error_returned_as_is() {
        let err = filter_test_error(
            Some(CancelCause::Cancelled),
            vec![
                HarnessError::Cancelled,
                HarnessError::assertion("invalid streams=1"),
            ],
        )
        .unwrap();
        assert_eq!(err.to_string(), "invalid streams=1");
    }

    #[test]
    fn test_multiple_errors_aggregate() {
        let err = filter_test_error(
            None,
            vec![
                HarnessError::assertion("invalid streams=1"),
                HarnessError::assertion("low score=50 < 90"),
                HarnessError::assertion("short duration=1s < 2s"),
            ],
        )
        .unwrap();
        let text = err.to_string();
        assert!(text.starts_with("invalid streams=1, with "));
        assert!(text.contains("err #0, low score=50 < 90"));
        assert!(text.contains("err #1, short duration=1s < 2s"));
    }

    #[test]
    fn test_process_exit_display_carries_tail() {
        let err = HarnessError::ProcessExit {
            program: "ffmpeg".into(),
            code: Some(1),
            reason: "non-zero exit".into(),
            tail: "Connection refused".into(),
        };
        assert!(err.to_string().contains("Connection refused"));
    }
}
