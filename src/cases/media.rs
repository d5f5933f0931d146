//! Publish-then-play cases: RTMP and SRT ingest, FLV and HLS playback.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::hphls::apply_hls_ctx;
use super::{settle, stream_id, Case, Harness, Verdict};
use crate::api::poll_until;
use crate::context::RunContext;
use crate::error::HarnessError;
use crate::media::session::{check_stream, probe_stream};
use crate::media::{OutputFormat, PublishSpec, StreamSession, TerminationPolicy};
use crate::task::ErrorSlots;

/// Both tracks of the sample file must come back.
const EXPECTED_STREAMS: usize = 2;

/// Publish `publish`, probe `probe_url` with fast-quit and check the result.
pub(crate) async fn publish_and_probe(
    harness: &Harness,
    ctx: &RunContext,
    stream: &str,
    publish: Option<PublishSpec>,
    probe_url: String,
    min_score: Option<i32>,
    probe_after_ready: Option<Duration>,
) -> Result<Verdict, HarnessError> {
    let probe = harness.probe_spec(stream, probe_url);
    let duration = probe.duration;
    let mut plan = harness.session_plan(publish, probe);
    if let Some(delay) = probe_after_ready {
        plan = plan.probe_after_ready(delay);
    }

    let (snapshot, outcome) = probe_stream(ctx, harness.tools(), plan).await;
    info!(
        stream,
        streams = snapshot.result.streams.len(),
        score = snapshot.result.score(),
        duration_ms = snapshot.result.duration().as_millis() as u64,
        "probed stream"
    );

    let mut slots = ErrorSlots::new();
    slots.extend(outcome);
    for err in check_stream(&snapshot.result, &snapshot.raw, EXPECTED_STREAMS, min_score, duration) {
        slots.record("stream", err);
    }
    slots.finish(ctx).map(|_| Verdict::Pass)
}

fn rtmp_url(harness: &Harness, path: &str) -> String {
    format!("{}/live/{}", harness.config().endpoints.rtmp, path)
}

/// RTMP publish, FLV playback. The secret goes either in the query string or
/// in the stream name itself.
pub struct FlvPlayback {
    secret_in_stream: bool,
}

impl FlvPlayback {
    pub fn secret_query() -> Self {
        Self {
            secret_in_stream: false,
        }
    }

    pub fn secret_stream() -> Self {
        Self {
            secret_in_stream: true,
        }
    }
}

#[async_trait]
impl Case for FlvPlayback {
    fn name(&self) -> &'static str {
        if self.secret_in_stream {
            "publish_rtmp_play_flv_secret_stream"
        } else {
            "publish_rtmp_play_flv_secret_query"
        }
    }

    fn requires_media(&self) -> bool {
        true
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let secret = harness.publish_secret(ctx).await?;
        let (stream, destination) = if self.secret_in_stream {
            let stream = format!(
                "stream-{}-{}",
                secret,
                stream_id().trim_start_matches("stream-")
            );
            let destination = rtmp_url(harness, &stream);
            (stream, destination)
        } else {
            let stream = stream_id();
            let destination = rtmp_url(harness, &format!("{}?secret={}", stream, secret));
            (stream, destination)
        };

        let publish = harness.publish_spec(destination, OutputFormat::Flv);
        let url = harness.playback_url(&stream, "flv");
        let threshold = harness.config().media.score_threshold;
        publish_and_probe(harness, ctx, &stream, Some(publish), url, Some(threshold), None).await
    }
}

/// RTMP publish, HLS playback. HLS scores low, so only streams and duration
/// are checked.
pub struct HlsPlaybackSecretQuery;

#[async_trait]
impl Case for HlsPlaybackSecretQuery {
    fn name(&self) -> &'static str {
        "publish_rtmp_play_hls_secret_query"
    }

    fn requires_media(&self) -> bool {
        true
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let secret = harness.publish_secret(ctx).await?;
        let stream = stream_id();
        let destination = rtmp_url(harness, &format!("{}?secret={}", stream, secret));
        let publish = harness.publish_spec(destination, OutputFormat::Flv);
        let url = harness.playback_url(&stream, "m3u8");
        publish_and_probe(harness, ctx, &stream, Some(publish), url, None, None).await
    }
}

/// SRT publish, FLV playback. SRT streams take a while to show up, so the
/// probe starts a tenth of the probe timeout after the publisher is ready.
pub struct SrtFlvPlayback;

#[async_trait]
impl Case for SrtFlvPlayback {
    fn name(&self) -> &'static str {
        "publish_srt_play_flv_secret_query"
    }

    fn requires_media(&self) -> bool {
        true
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let secret = harness.publish_secret(ctx).await?;
        let stream = stream_id();
        let destination = format!(
            "{}?streamid=#!::r=live/{}?secret={},m=publish",
            harness.config().endpoints.srt,
            stream,
            secret
        );
        let publish = harness.publish_spec(destination, OutputFormat::MpegTs);
        let url = harness.playback_url(&stream, "flv");
        let threshold = harness.config().media.score_threshold;
        let delay = harness.config().media.probe_timeout() / 10;
        publish_and_probe(harness, ctx, &stream, Some(publish), url, Some(threshold), Some(delay)).await
    }
}

/// Check the playlist shape for the given hls_ctx setting.
///
/// Without the context the server answers with the media playlist itself
/// (segment entries, no `hls_ctx` redirect). With it, the first answer is a
/// master playlist pointing at `<stream>.m3u8?hls_ctx=...`.
pub fn check_manifest(body: &str, no_hls_ctx: bool) -> Result<(), HarnessError> {
    let has_ctx = body.contains(".m3u8?hls_ctx=");
    let has_segments = body.contains("#EXTINF:");
    let ok = if no_hls_ctx {
        !has_ctx && has_segments
    } else {
        has_ctx && !has_segments
    };
    if ok {
        Ok(())
    } else {
        Err(HarnessError::assertion(format!("invalid hls playlist={}", body)))
    }
}

/// RTMP publish, HLS playback under observe-then-stop: after the probe, the
/// publisher keeps going while the manifest is fetched and checked.
pub struct HlsManifest {
    pub no_hls_ctx: bool,
}

impl HlsManifest {
    async fn observe(&self, harness: &Harness, ctx: &RunContext) -> Result<(), HarnessError> {
        let secret = harness.publish_secret(ctx).await?;
        let stream = stream_id();
        let destination = rtmp_url(harness, &format!("{}?secret={}", stream, secret));
        let publish = harness.publish_spec(destination, OutputFormat::Flv);
        let hls_url = harness.playback_url(&stream, "m3u8");
        let probe = harness.probe_spec(&stream, hls_url.clone());
        let duration = probe.duration;
        let plan = harness
            .session_plan(Some(publish), probe)
            .policy(TerminationPolicy::ObserveThenStop);

        let session = StreamSession::launch(ctx, harness.tools(), plan);
        session.wait_probe().await;
        let (raw, result) = session.result();

        let mut slots = ErrorSlots::new();
        for err in check_stream(&result, &raw, EXPECTED_STREAMS, None, duration) {
            slots.record("stream", err);
        }

        // Still publishing: the playlist must reflect the setting.
        let (attempts, interval) = settle(harness);
        let api = harness.api();
        let no_hls_ctx = self.no_hls_ctx;
        let url = hls_url.as_str();
        let manifest = poll_until(ctx, "hls playlist", attempts, interval, move || async move {
            let body = api.fetch_text(ctx, url).await?;
            debug!(bytes = body.len(), "fetched playlist");
            check_manifest(&body, no_hls_ctx).map(|_| Some(()))
        })
        .await;
        slots.record_result("manifest", manifest);

        session.stop();
        slots.extend(session.shutdown().await);
        slots.finish(ctx)
    }
}

#[async_trait]
impl Case for HlsManifest {
    fn name(&self) -> &'static str {
        if self.no_hls_ctx {
            "publish_rtmp_play_hls_no_hls_ctx"
        } else {
            "publish_rtmp_play_hls_with_hls_ctx"
        }
    }

    fn requires_media(&self) -> bool {
        true
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let restore = apply_hls_ctx(harness, ctx, self.no_hls_ctx).await?;
        let observed = self.observe(harness, ctx).await;
        let _ = restore.run().await;
        observed.map(|_| Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-MEDIA-SEQUENCE:0\n\
        #EXT-X-TARGETDURATION:15\n#EXT-X-DISCONTINUITY\n#EXTINF:10.008, no desc\n\
        stream-15318-7260362267190950336-0.ts\n#EXTINF:11.989, no desc\n\
        stream-15318-7260362267190950336-1.ts\n";

    const MASTER_PLAYLIST: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,AVERAGE-BANDWIDTH=1\n\
        /live/stream-22525-1463247945540465917.m3u8?hls_ctx=84q1332s\n";

    #[test]
    fn test_manifest_without_ctx() {
        assert!(check_manifest(MEDIA_PLAYLIST, true).is_ok());
        assert!(check_manifest(MASTER_PLAYLIST, true).is_err());
    }

    #[test]
    fn test_manifest_with_ctx() {
        assert!(check_manifest(MASTER_PLAYLIST, false).is_ok());
        let err = check_manifest(MEDIA_PLAYLIST, false).unwrap_err();
        assert!(err.to_string().starts_with("invalid hls playlist=#EXTM3U"));
    }

    #[test]
    fn test_case_names() {
        assert_eq!(FlvPlayback::secret_query().name(), "publish_rtmp_play_flv_secret_query");
        assert_eq!(FlvPlayback::secret_stream().name(), "publish_rtmp_play_flv_secret_stream");
        assert_eq!(HlsManifest { no_hls_ctx: true }.name(), "publish_rtmp_play_hls_no_hls_ctx");
        assert!(SrtFlvPlayback.requires_media());
    }
}
