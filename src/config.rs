//! TOML configuration for streamcheck.
//!
//! Every knob of a suite run lives here: where the server is, how to
//! authenticate, which tools and sample file to use, and the timing budgets.
//! The loaded value is immutable and shared by the harness.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::media::MediaTools;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "STREAMCHECK_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "streamcheck.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub suite: SuiteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `STREAMCHECK_CONFIG`.
    /// 2. `./streamcheck.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "STREAMCHECK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back as in
    /// [`HarnessConfig::load_or_default`].
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn tools(&self) -> MediaTools {
        MediaTools {
            ffmpeg: self.media.ffmpeg.clone(),
            ffprobe: self.media.ffprobe.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Where the server under test listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Management API base URL.
    pub api: String,
    /// HTTP playback base URL (FLV, HLS).
    pub http: String,
    /// RTMP ingest base URL.
    pub rtmp: String,
    /// SRT ingest URL.
    pub srt: String,
    /// Accept any certificate on HTTPS endpoints.
    pub https_insecure_verify: bool,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            api: "http://localhost:2022".to_string(),
            http: "http://localhost:2022".to_string(),
            rtmp: "rtmp://localhost".to_string(),
            srt: "srt://localhost:10080".to_string(),
            https_insecure_verify: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token for the management API.
    pub api_secret: String,
    /// Password for the login case.
    pub system_password: String,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Tools, sample file and probe timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Sample file with one video and one audio track.
    pub input_file: PathBuf,
    /// How much of the played-back stream to record.
    pub probe_duration_ms: u64,
    /// Upper bound for one probe, retries included.
    pub probe_timeout_ms: u64,
    /// Minimum ffprobe score for FLV playback.
    pub score_threshold: i32,
    /// Time the publisher must stay up before it counts as ready.
    pub publish_grace_ms: u64,
    pub retry_interval_ms: u64,
    pub stall_window_ms: u64,
    pub inspect_timeout_ms: u64,
    /// Directory for DVR side files.
    pub dvr_dir: PathBuf,
    /// Candidate upload directories for the virtual-live sample.
    pub upload_dirs: Vec<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            input_file: PathBuf::from("source.200kbps.768x320.flv"),
            probe_duration_ms: 16_000,
            probe_timeout_ms: 21_000,
            score_threshold: 90,
            publish_grace_ms: 500,
            retry_interval_ms: 1_000,
            stall_window_ms: 3_000,
            inspect_timeout_ms: 10_000,
            dvr_dir: PathBuf::from("."),
            upload_dirs: vec![
                PathBuf::from("/data/upload/"),
                PathBuf::from("platform/containers/data/upload"),
                PathBuf::from("../platform/containers/data/upload"),
            ],
        }
    }
}

impl MediaConfig {
    pub fn probe_duration(&self) -> Duration {
        Duration::from_millis(self.probe_duration_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn publish_grace(&self) -> Duration {
        Duration::from_millis(self.publish_grace_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_window_ms)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_millis(self.inspect_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Deadline for each case.
    pub timeout_ms: u64,
    /// Per-request timeout of the API client.
    pub request_timeout_ms: u64,
    pub no_media_test: bool,
    pub no_bilibili_test: bool,
    /// Domain for the Let's Encrypt case; empty skips it.
    pub domain_lets_encrypt: String,
    /// Attempts when waiting for a server setting to take effect.
    pub settle_attempts: u32,
    pub settle_interval_ms: u64,
    /// Bound for restoring a setting after a case.
    pub restore_timeout_ms: u64,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 64_000,
            request_timeout_ms: 10_000,
            no_media_test: false,
            no_bilibili_test: false,
            domain_lets_encrypt: String::new(),
            settle_attempts: 20,
            settle_interval_ms: 500,
            restore_timeout_ms: 10_000,
        }
    }
}

impl SuiteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.endpoints.api, "http://localhost:2022");
        assert_eq!(cfg.endpoints.rtmp, "rtmp://localhost");
        assert_eq!(cfg.media.score_threshold, 90);
        assert!(cfg.media.probe_timeout() > cfg.media.probe_duration());
        assert!(cfg.suite.timeout() > cfg.media.probe_timeout());
        assert_eq!(cfg.media.upload_dirs.len(), 3);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[media]
probe_duration_ms = 4000

[suite]
no_media_test = true
"#;
        let cfg: HarnessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.media.probe_duration(), Duration::from_millis(4000));
        assert!(cfg.suite.no_media_test);
        assert_eq!(cfg.media.ffprobe, PathBuf::from("ffprobe"));
        assert_eq!(cfg.endpoints.srt, "srt://localhost:10080");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("streamcheck.toml");
        std::fs::write(
            &path,
            r#"
[auth]
api_secret = "xyz"
"#,
        )
        .unwrap();
        let cfg = HarnessConfig::load(&path).unwrap();
        assert_eq!(cfg.auth.api_secret, "xyz");
    }

    #[test]
    fn test_resolve_explicit_missing_file_errors() {
        assert!(HarnessConfig::resolve(Some(Path::new("/nonexistent/streamcheck.toml"))).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = HarnessConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: HarnessConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg.media.probe_timeout_ms, back.media.probe_timeout_ms);
        assert_eq!(cfg.media.upload_dirs, back.media.upload_dirs);
    }
}
