//! ffprobe JSON model (subset of fields we care about).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Parsed `ffprobe -print_format json -show_format -show_streams` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: ProbeFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeStream {
    pub index: u32,
    pub codec_name: String,
    pub codec_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeFormat {
    pub filename: String,
    pub nb_streams: u32,
    pub nb_programs: u32,
    pub format_name: String,
    pub format_long_name: String,
    pub start_time: String,
    pub duration: String,
    pub size: String,
    pub bit_rate: String,
    pub probe_score: i32,
}

impl ProbeResult {
    /// Parse ffprobe output; fails on malformed JSON.
    pub fn parse(raw: &str) -> Result<Self, HarnessError> {
        serde_json::from_str(raw).map_err(|source| HarnessError::Decode {
            what: "ffprobe output".to_string(),
            source,
        })
    }

    /// Parse ffprobe output, yielding an empty result when there is nothing
    /// usable. A stream that never showed up is a testable outcome, not an
    /// infrastructure failure.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match Self::parse(raw) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, bytes = raw.len(), "unparsable ffprobe output");
                Self::default()
            }
        }
    }

    /// Container duration as reported by ffprobe, zero when absent.
    pub fn duration(&self) -> Duration {
        self.format
            .duration
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    }

    /// ffprobe's 0..=100 confidence in the detected container.
    pub fn score(&self) -> i32 {
        self.format.probe_score
    }

    pub fn streams_of(&self, codec_type: &str) -> impl Iterator<Item = &ProbeStream> {
        let codec_type = codec_type.to_string();
        self.streams
            .iter()
            .filter(move |s| s.codec_type == codec_type)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// What a finished probe produced: the raw tool output and its parsed form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeSnapshot {
    pub raw: String,
    pub result: ProbeResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("fixtures")
            .join("ffprobe")
            .join(name);
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_parse_flv_fixture() {
        let result = ProbeResult::parse(&fixture("flv-2track.json")).unwrap();
        assert_eq!(result.streams.len(), 2);
        assert_eq!(result.streams[0].codec_type, "video");
        assert_eq!(result.streams[0].codec_name, "h264");
        assert_eq!(result.streams[0].profile.as_deref(), Some("High"));
        assert_eq!(result.streams[1].codec_name, "aac");
        assert_eq!(result.streams[1].sample_rate.as_deref(), Some("44100"));
        assert_eq!(result.streams[1].channels, Some(2));
        assert_eq!(result.score(), 100);
        assert_eq!(result.duration(), Duration::from_millis(4011));
        assert_eq!(result.streams_of("audio").count(), 1);
    }

    #[test]
    fn test_parse_hls_fixture_low_score() {
        let result = ProbeResult::parse(&fixture("hls-2track.json")).unwrap();
        assert_eq!(result.streams.len(), 2);
        assert!(result.score() < 90);
        assert_eq!(result.duration(), Duration::from_millis(2560));
    }

    #[test]
    fn test_missing_sections_default() {
        // ffprobe -show_error on an empty file prints only an error object.
        let raw = r#"{"error": {"code": -1094995529, "string": "Invalid data found when processing input"}}"#;
        let result = ProbeResult::parse(raw).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.score(), 0);
        assert_eq!(result.duration(), Duration::ZERO);
    }

    #[test]
    fn test_lenient_parse_of_garbage() {
        assert!(ProbeResult::parse("not json").is_err());
        assert_eq!(ProbeResult::parse_lenient("not json"), ProbeResult::default());
        assert_eq!(ProbeResult::parse_lenient("  \n"), ProbeResult::default());
    }

    #[test]
    fn test_display_is_json() {
        let result = ProbeResult::parse(&fixture("flv-2track.json")).unwrap();
        let text = result.to_string();
        assert!(text.starts_with('{'));
        assert!(text.contains("\"probe_score\":100"));
    }
}
