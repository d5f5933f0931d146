//! Request and response bodies of the management API endpoints we drive.

use serde::{Deserialize, Serialize};

/// Endpoint paths, relative to the API endpoint.
pub mod paths {
    pub const SECRET_QUERY: &str = "/terraform/v1/hooks/srs/secret/query";
    pub const SECRET_UPDATE: &str = "/terraform/v1/hooks/srs/secret/update";
    pub const LOGIN: &str = "/terraform/v1/mgmt/login";
    pub const ENVS: &str = "/terraform/v1/mgmt/envs";
    pub const INIT: &str = "/terraform/v1/mgmt/init";
    pub const CHECK: &str = "/terraform/v1/mgmt/check";
    pub const VERSIONS: &str = "/terraform/v1/mgmt/versions";
    pub const BEIAN_UPDATE: &str = "/terraform/v1/mgmt/beian/update";
    pub const BEIAN_QUERY: &str = "/terraform/v1/mgmt/beian/query";
    pub const BILIBILI: &str = "/terraform/v1/mgmt/bilibili";
    pub const SSL: &str = "/terraform/v1/mgmt/ssl";
    pub const LETS_ENCRYPT: &str = "/terraform/v1/mgmt/letsencrypt";
    pub const CERT_QUERY: &str = "/terraform/v1/mgmt/cert/query";
    pub const HPHLS_QUERY: &str = "/terraform/v1/mgmt/hphls/query";
    pub const HPHLS_UPDATE: &str = "/terraform/v1/mgmt/hphls/update";
    pub const VLIVE_SERVER: &str = "/terraform/v1/ffmpeg/vlive/server";
    pub const VLIVE_SOURCE: &str = "/terraform/v1/ffmpeg/vlive/source";
    pub const VLIVE_SECRET: &str = "/terraform/v1/ffmpeg/vlive/secret";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSecret {
    pub publish: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretUpdate {
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Envs {
    pub mgmt_docker: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Init {
    pub init: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Check {
    pub upgrading: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Versions {
    pub version: String,
}

/// `beian` selects the website setting (`icp` footer or `title`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeianUpdate {
    pub beian: String,
    pub text: String,
}

impl BeianUpdate {
    pub fn footer(text: impl Into<String>) -> Self {
        Self { beian: "icp".to_string(), text: text.into() }
    }

    pub fn title(text: impl Into<String>) -> Self {
        Self { beian: "title".to_string(), text: text.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Beian {
    pub icp: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BilibiliQuery {
    pub bvid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BilibiliVideo {
    pub title: String,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslUpdate {
    pub key: String,
    pub crt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LetsEncrypt {
    pub domain: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    pub provider: String,
    pub key: String,
    pub crt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HpHls {
    pub no_hls_ctx: bool,
}

/// A file the server accepted as a virtual-live source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VLiveFile {
    pub name: String,
    pub size: i64,
    pub target: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VLiveSourceRequest {
    pub platform: String,
    pub files: Vec<VLiveFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VLiveSource {
    pub files: Vec<VLiveCodec>,
}

/// Codec details the server detected in a virtual-live source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VLiveCodec {
    pub uuid: String,
    pub audio: VLiveAudio,
    pub video: VLiveVideo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VLiveAudio {
    pub codec_name: String,
    pub channels: u32,
    pub sample_rate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VLiveVideo {
    pub codec_name: String,
    pub profile: String,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hphls_uses_camel_case() {
        let json = serde_json::to_string(&HpHls { no_hls_ctx: true }).unwrap();
        assert_eq!(json, r#"{"noHlsCtx":true}"#);
        let back: HpHls = serde_json::from_str("{}").unwrap();
        assert!(!back.no_hls_ctx);
    }

    #[test]
    fn test_envs_field_name() {
        let envs: Envs = serde_json::from_str(r#"{"mgmtDocker":true,"other":1}"#).unwrap();
        assert!(envs.mgmt_docker);
    }

    #[test]
    fn test_vlive_source_decodes_codec() {
        let raw = r#"{"files":[{"uuid":"u1","audio":{"codec_name":"aac","channels":2,"sample_rate":"44100"},
            "video":{"codec_name":"h264","profile":"High","width":768,"height":320}}]}"#;
        let source: VLiveSource = serde_json::from_str(raw).unwrap();
        assert_eq!(source.files[0].uuid, "u1");
        assert_eq!(source.files[0].video.width, 768);
        assert_eq!(source.files[0].audio.sample_rate, "44100");
    }
}
