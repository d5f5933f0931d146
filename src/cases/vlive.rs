//! Virtual live: the server itself publishes an uploaded file, we only play.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::media::publish_and_probe;
use super::{stream_id, Case, Harness, Verdict};
use crate::api::types::{paths, VLiveAudio, VLiveCodec, VLiveFile, VLiveSource, VLiveSourceRequest, VLiveVideo};
use crate::context::RunContext;
use crate::error::HarnessError;
use crate::fixtures::{copy_to_dest, existing_file, upload_path};

/// The sample file's tracks, as the server should detect them.
fn expected_codec() -> (VLiveAudio, VLiveVideo) {
    (
        VLiveAudio {
            codec_name: "aac".to_string(),
            channels: 2,
            sample_rate: "44100".to_string(),
        },
        VLiveVideo {
            codec_name: "h264".to_string(),
            profile: "High".to_string(),
            width: 768,
            height: 320,
        },
    )
}

fn check_codec(codec: &VLiveCodec, file: &VLiveFile) -> Result<(), HarnessError> {
    if codec.uuid != file.uuid {
        return Err(HarnessError::assertion(format!(
            "invalid codec uuid={}, {}",
            codec.uuid, file.uuid
        )));
    }
    let (audio, video) = expected_codec();
    if codec.audio != audio {
        return Err(HarnessError::assertion(format!("invalid codec audio={:?}", codec.audio)));
    }
    if codec.video != video {
        return Err(HarnessError::assertion(format!("invalid codec video={:?}", codec.video)));
    }
    Ok(())
}

pub struct VLiveFlvPlayback;

#[async_trait]
impl Case for VLiveFlvPlayback {
    fn name(&self) -> &'static str {
        "publish_vlive_play_flv"
    }

    fn requires_media(&self) -> bool {
        true
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let api = harness.api();
        let media = &harness.config().media;
        let secret = harness.publish_secret(ctx).await?;

        copy_to_dest(&media.input_file, &media.upload_dirs)?;
        let found = existing_file(&media.input_file, &media.upload_dirs)
            .ok_or_else(|| HarnessError::assertion("no source file found"))?;
        let source = upload_path(&found);

        let file: VLiveFile = api
            .query(ctx, &format!("{}?file={}", paths::VLIVE_SERVER, source))
            .await?;
        let request = VLiveSourceRequest {
            platform: "bilibili".to_string(),
            files: vec![file.clone()],
        };
        let detected: VLiveSource = api.request(ctx, paths::VLIVE_SOURCE, Some(&request)).await?;
        let codec = detected
            .files
            .first()
            .ok_or_else(|| HarnessError::assertion("vlive source returned no files"))?;
        check_codec(codec, &file)?;

        let mut conf: Map<String, Value> = api.query(ctx, paths::VLIVE_SECRET).await?;
        let mut platform = match conf.remove("bilibili") {
            Some(Value::Object(p)) => p,
            _ => return Err(HarnessError::assertion("invalid bilibili secret")),
        };
        platform.insert("action".to_string(), Value::from("update"));
        let restore = api.with_restore(
            "vlive bilibili",
            paths::VLIVE_SECRET,
            &platform,
            harness.config().suite.restore_timeout(),
        )?;

        let stream = stream_id();
        platform.insert("secret".to_string(), Value::from(format!("{}?secret={}", stream, secret)));
        platform.insert("server".to_string(), Value::from("rtmp://localhost/live/"));
        platform.insert("enabled".to_string(), Value::from(true));

        let probed = async {
            api.update(ctx, paths::VLIVE_SECRET, &platform).await?;
            let url = harness.playback_url(&stream, "flv");
            let threshold = media.score_threshold;
            publish_and_probe(harness, ctx, &stream, None, url, Some(threshold), None).await
        }
        .await;
        // Restore failures are logged by the guard.
        let _ = restore.run().await;
        probed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> VLiveFile {
        VLiveFile {
            uuid: "u1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_check_codec_accepts_sample() {
        let (audio, video) = expected_codec();
        let codec = VLiveCodec {
            uuid: "u1".to_string(),
            audio,
            video,
        };
        assert!(check_codec(&codec, &file()).is_ok());
    }

    #[test]
    fn test_check_codec_rejects_wrong_uuid_and_video() {
        let (audio, mut video) = expected_codec();
        let codec = VLiveCodec {
            uuid: "other".to_string(),
            audio: audio.clone(),
            video: video.clone(),
        };
        assert!(check_codec(&codec, &file()).is_err());

        video.width = 1280;
        let codec = VLiveCodec {
            uuid: "u1".to_string(),
            audio,
            video,
        };
        let err = check_codec(&codec, &file()).unwrap_err();
        assert!(err.to_string().starts_with("invalid codec video="));
    }
}
