//! End-to-end cases against a running server, and the suite runner.
//!
//! Each case runs under its own deadline-bounded context and reports through
//! [`ErrorSlots`](crate::task::ErrorSlots), so intentional cancellations never
//! show up as failures.

pub mod hphls;
pub mod media;
pub mod mgmt;
pub mod vlive;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api::types::{paths, PublishSecret};
use crate::api::ApiClient;
use crate::config::HarnessConfig;
use crate::context::RunContext;
use crate::error::HarnessError;
use crate::media::{MediaTools, OutputFormat, ProbeSpec, PublishSpec, SessionPlan};
use crate::report::{CaseReport, CaseStatus, SuiteReport};

/// How a case that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Skipped(String),
}

impl Verdict {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Verdict::Skipped(reason.into())
    }
}

#[async_trait]
pub trait Case: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cases that publish or play streams; skipped with `no_media_test`.
    fn requires_media(&self) -> bool {
        false
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError>;
}

/// Every case, in the order the suite runs them.
///
/// The order matters: `update_publish_secret` changes the secret the media
/// cases publish with, so cases are never run in parallel.
pub fn all() -> Vec<Box<dyn Case>> {
    vec![
        Box::new(mgmt::Empty),
        Box::new(mgmt::Ready),
        Box::new(mgmt::QueryPublishSecret),
        Box::new(mgmt::LoginByPassword),
        Box::new(mgmt::BootstrapQueryEnvs),
        Box::new(mgmt::BootstrapQueryInit),
        Box::new(mgmt::BootstrapQueryCheck),
        Box::new(mgmt::BootstrapQueryVersions),
        Box::new(mgmt::SetupWebsiteFooter),
        Box::new(mgmt::SetupWebsiteTitle),
        Box::new(mgmt::UpdatePublishSecret),
        Box::new(mgmt::TutorialsQueryBilibili),
        Box::new(mgmt::SslUpdateCert),
        Box::new(mgmt::LetsEncryptUpdateCert),
        Box::new(hphls::SetupHpHls { no_hls_ctx: true }),
        Box::new(hphls::SetupHpHls { no_hls_ctx: false }),
        Box::new(media::FlvPlayback::secret_query()),
        Box::new(media::FlvPlayback::secret_stream()),
        Box::new(media::HlsPlaybackSecretQuery),
        Box::new(media::SrtFlvPlayback),
        Box::new(media::HlsManifest { no_hls_ctx: true }),
        Box::new(media::HlsManifest { no_hls_ctx: false }),
        Box::new(vlive::VLiveFlvPlayback),
    ]
}

/// Names of every registered case.
pub fn names() -> Vec<&'static str> {
    all().iter().map(|c| c.name()).collect()
}

/// Shared state of a suite run: configuration, API client and tools.
#[derive(Debug, Clone)]
pub struct Harness {
    config: Arc<HarnessConfig>,
    api: ApiClient,
    tools: MediaTools,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        let secret = Some(config.auth.api_secret.clone());
        let api = ApiClient::new(
            config.endpoints.api.clone(),
            secret,
            config.endpoints.https_insecure_verify,
            config.suite.request_timeout(),
        )?;
        let tools = config.tools();
        Ok(Self {
            config: Arc::new(config),
            api,
            tools,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn tools(&self) -> &MediaTools {
        &self.tools
    }

    /// Fresh context for one case.
    pub fn case_context(&self) -> RunContext {
        RunContext::background().with_timeout(self.config.suite.timeout())
    }

    pub async fn publish_secret(&self, ctx: &RunContext) -> Result<String, HarnessError> {
        let secret: PublishSecret = self.api.query(ctx, paths::SECRET_QUERY).await?;
        Ok(secret.publish)
    }

    /// `<http>/live/<stream>.<ext>` playback URL.
    pub fn playback_url(&self, stream_id: &str, ext: &str) -> String {
        format!("{}/live/{}.{}", self.config.endpoints.http, stream_id, ext)
    }

    /// Probe the playback URL of `stream_id`, recording into the DVR dir.
    pub fn probe_spec(&self, stream_id: &str, url: String) -> ProbeSpec {
        let media = &self.config.media;
        let mut spec = ProbeSpec::new(
            url,
            dvr_file(&media.dvr_dir, stream_id),
            media.probe_duration(),
            media.probe_timeout(),
        );
        spec.retry_interval = media.retry_interval();
        spec.stall_window = media.stall_window();
        spec.inspect_timeout = media.inspect_timeout();
        spec
    }

    pub fn publish_spec(&self, destination: String, format: OutputFormat) -> PublishSpec {
        PublishSpec::new(&self.config.media.input_file, destination, format)
    }

    pub fn session_plan(&self, publish: Option<PublishSpec>, probe: ProbeSpec) -> SessionPlan {
        let mut plan = SessionPlan::new(publish, probe);
        plan.publish_grace = self.config.media.publish_grace();
        plan
    }
}

/// Unique stream name for one case.
pub fn stream_id() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("stream-{}-{}", std::process::id(), n)
}

pub fn dvr_file(dir: &std::path::Path, stream_id: &str) -> PathBuf {
    dir.join(format!("srs-ffprobe-{}.flv", stream_id))
}

/// Run one case under a fresh deadline and turn the result into a report row.
pub async fn run_case(case: &dyn Case, harness: &Harness) -> CaseReport {
    let started = Instant::now();
    let name = case.name();

    let (status, details) = if case.requires_media() && harness.config().suite.no_media_test {
        (CaseStatus::Skipped, "no_media_test".to_string())
    } else {
        let ctx = harness.case_context();
        info!(case = %name, "case started");
        match case.run(harness, &ctx).await {
            Ok(Verdict::Pass) => (CaseStatus::Pass, String::new()),
            Ok(Verdict::Skipped(reason)) => (CaseStatus::Skipped, reason),
            Err(e) => {
                warn!(case = %name, error = %e, "case failed");
                (CaseStatus::Fail, e.to_string())
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(case = %name, status = status.as_str(), duration_ms, "case done");
    CaseReport {
        name: name.to_string(),
        status,
        details,
        duration_ms,
    }
}

/// Run the registered cases one after another.
///
/// An empty `filter` runs everything; otherwise only the named cases run.
pub async fn run_suite(harness: &Harness, filter: &[String]) -> Result<SuiteReport, HarnessError> {
    let cases = all();
    if let Some(unknown) = filter.iter().find(|f| !cases.iter().any(|c| c.name() == f.as_str())) {
        return Err(HarnessError::assertion(format!("unknown case {}", unknown)));
    }

    let mut report = SuiteReport::new();
    info!(run_id = %report.run_id, cases = cases.len(), "suite started");
    for case in cases
        .iter()
        .filter(|c| filter.is_empty() || filter.iter().any(|f| f == c.name()))
    {
        report.push(run_case(case.as_ref(), harness).await);
    }
    report.finish();
    Ok(report)
}

/// Settle attempts and interval from the suite config.
pub(crate) fn settle(harness: &Harness) -> (u32, Duration) {
    let suite = &harness.config().suite;
    (suite.settle_attempts, suite.settle_interval())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_case_names_unique() {
        let names = names();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.contains(&"publish_rtmp_play_hls_with_hls_ctx"));
        assert!(names.contains(&"publish_vlive_play_flv"));
    }

    #[test]
    fn test_stream_id_shape() {
        let id = stream_id();
        assert!(id.starts_with(&format!("stream-{}-", std::process::id())));
        assert_ne!(id, stream_id());
    }

    #[test]
    fn test_urls_and_dvr_file() {
        let harness = Harness::new(HarnessConfig::default()).unwrap();
        assert_eq!(
            harness.playback_url("s1", "m3u8"),
            "http://localhost:2022/live/s1.m3u8"
        );
        let spec = harness.probe_spec("s1", harness.playback_url("s1", "flv"));
        assert_eq!(spec.dvr_file, PathBuf::from("./srs-ffprobe-s1.flv"));
        assert_eq!(spec.duration, Duration::from_millis(16_000));
    }

    #[tokio::test]
    async fn test_media_case_skipped_without_media() {
        let mut config = HarnessConfig::default();
        config.suite.no_media_test = true;
        let harness = Harness::new(config).unwrap();
        let case = media::FlvPlayback::secret_query();
        let row = run_case(&case, &harness).await;
        assert_eq!(row.status, CaseStatus::Skipped);
    }

    #[tokio::test]
    async fn test_empty_case_passes() {
        let harness = Harness::new(HarnessConfig::default()).unwrap();
        let report = run_suite(&harness, &["empty".to_string()]).await.unwrap();
        assert_eq!(report.cases.len(), 1);
        assert_eq!(report.cases[0].status, CaseStatus::Pass);
    }

    #[tokio::test]
    async fn test_unknown_case_rejected() {
        let harness = Harness::new(HarnessConfig::default()).unwrap();
        assert!(run_suite(&harness, &["nope".to_string()]).await.is_err());
    }
}
