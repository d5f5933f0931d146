//! Media units: the publisher feeding the server, the prober reading it back,
//! and the session that runs them together.

pub mod model;
pub mod prober;
pub mod publisher;
pub mod session;

use std::path::PathBuf;

pub use model::{ProbeFormat, ProbeResult, ProbeSnapshot, ProbeStream};
pub use prober::{ProbeSpec, Prober, ProberState};
pub use publisher::{OutputFormat, PublishSpec, Publisher, PublisherState};
pub use session::{ProbeWait, SessionPlan, StreamSession, TerminationPolicy};

/// External tools driven by the media units.
#[derive(Debug, Clone)]
pub struct MediaTools {
    /// Used both for publishing and for recording the played-back stream.
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}
