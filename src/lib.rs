//! streamcheck -- end-to-end validation harness for live-streaming servers.
//!
//! The crate drives real `ffmpeg` publishers and `ffmpeg`/`ffprobe` probers
//! against a running media server, then asserts properties of the streams it
//! gets back and of the server's management API.

pub mod api;
pub mod cases;
pub mod cert;
pub mod config;
pub mod context;
pub mod error;
pub mod fixtures;
pub mod media;
pub mod process;
pub mod report;
pub mod task;

pub use context::{Canceller, ReadinessSignal, RunContext};
pub use error::{filter_test_error, HarnessError};
