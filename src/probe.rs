//! Optional codec/resolution enrichment via `ffprobe`.
//!
//! The probe is best effort: a missing binary, a non-zero exit, unparseable
//! output or a timeout all yield `None`, and callers omit the enrichment.

use crate::config::Config;
use crate::url_validation::SourceUrl;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoStreamInfo {
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub codec: Option<String>,
    pub bitrate: Option<String>,
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioStreamInfo {
    pub language: String,
    pub codec: Option<String>,
    pub channels: Option<u64>,
    pub sample_rate: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeReport {
    pub video_streams: Vec<VideoStreamInfo>,
    pub audio_streams: Vec<AudioStreamInfo>,
}

/// Source of media metadata for `/validate`
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    /// Inspect `url`; `None` means "no enrichment available".
    async fn probe(&self, url: &SourceUrl) -> Option<ProbeReport>;
}

/// Probe used when enrichment is switched off
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProbe;

#[async_trait]
impl MetadataProbe for DisabledProbe {
    async fn probe(&self, _url: &SourceUrl) -> Option<ProbeReport> {
        None
    }
}

/// Runs the external `ffprobe` binary with a hard timeout
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: String,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MetadataProbe for FfprobeProbe {
    async fn probe(&self, url: &SourceUrl) -> Option<ProbeReport> {
        let mut command = Command::new(&self.binary);
        command
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                url.as_str(),
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // kill_on_drop reaps the child if the timeout fires first
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "ffprobe not found at '{}'. Install ffmpeg to enable metadata detection.",
                    self.binary
                );
                return None;
            }
            Ok(Err(e)) => {
                warn!("Failed to run ffprobe for {}: {}", url, e);
                return None;
            }
            Err(_) => {
                warn!("ffprobe timed out after {:?} for {}", self.timeout, url);
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                "ffprobe exited with {} for {}: {}",
                output.status,
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        match parse_ffprobe_output(&output.stdout) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Unparseable ffprobe output for {}: {}", url, e);
                None
            }
        }
    }
}

/// Pick the probe implementation the configuration asks for.
pub fn from_config(config: &Config) -> Arc<dyn MetadataProbe> {
    if config.probe_enabled {
        Arc::new(FfprobeProbe::new(
            config.ffprobe_path.clone(),
            config.probe_timeout,
        ))
    } else {
        debug!("Metadata probe disabled");
        Arc::new(DisabledProbe)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    bit_rate: Option<String>,
    r_frame_rate: Option<String>,
    channels: Option<u64>,
    sample_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Split ffprobe's JSON into video and audio stream summaries.
pub fn parse_ffprobe_output(stdout: &[u8]) -> Result<ProbeReport, serde_json::Error> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    let mut report = ProbeReport::default();

    for stream in parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") => report.video_streams.push(VideoStreamInfo {
                width: stream.width,
                height: stream.height,
                codec: stream.codec_name,
                bitrate: stream.bit_rate,
                fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
            }),
            Some("audio") => report.audio_streams.push(AudioStreamInfo {
                language: stream
                    .tags
                    .get("language")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
                codec: stream.codec_name,
                channels: stream.channels,
                sample_rate: stream.sample_rate,
            }),
            _ => {}
        }
    }

    Ok(report)
}

/// Parse an ffprobe rational such as `30000/1001` into frames per second.
///
/// A bare integer is accepted as `N/1`. A zero denominator yields `None`.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = match raw.trim().split_once('/') {
        Some((num, den)) => (num.trim(), den.trim()),
        None => (raw.trim(), "1"),
    };

    let num: u64 = num.parse().ok()?;
    let den: u64 = den.parse().ok()?;
    if den == 0 {
        return None;
    }
    Some(num as f64 / den as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_validation::validate_source_url;

    const FFPROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920,
             "height": 1080, "bit_rate": "4500000", "r_frame_rate": "30000/1001"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 2,
             "sample_rate": "48000", "tags": {"language": "eng"}},
            {"index": 2, "codec_type": "audio", "codec_name": "opus", "channels": 6,
             "sample_rate": "48000"},
            {"index": 3, "codec_type": "subtitle", "codec_name": "mov_text"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"}
    }"#;

    #[test]
    fn frame_rate_rational() {
        let fps = parse_frame_rate("30000/1001").unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
    }

    #[test]
    fn frame_rate_guards_zero_and_garbage() {
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("__import__('os')"), None);
        assert_eq!(parse_frame_rate("1/2/3"), None);
        assert_eq!(parse_frame_rate(""), None);
    }

    #[test]
    fn parses_video_and_audio_streams() {
        let report = parse_ffprobe_output(FFPROBE_JSON.as_bytes()).unwrap();

        assert_eq!(report.video_streams.len(), 1);
        let video = &report.video_streams[0];
        assert_eq!(video.width, Some(1920));
        assert_eq!(video.height, Some(1080));
        assert_eq!(video.codec.as_deref(), Some("h264"));
        assert_eq!(video.bitrate.as_deref(), Some("4500000"));

        assert_eq!(report.audio_streams.len(), 2);
        assert_eq!(report.audio_streams[0].language, "eng");
        assert_eq!(report.audio_streams[1].language, "unknown");
        assert_eq!(report.audio_streams[1].channels, Some(6));
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_ffprobe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_none() {
        let probe = FfprobeProbe::new(
            "/nonexistent/streamgate-ffprobe",
            Duration::from_secs(1),
        );
        let url = validate_source_url("https://cdn.example.com/video.mp4").unwrap();
        assert!(probe.probe(&url).await.is_none());
    }

    #[tokio::test]
    async fn disabled_probe_returns_none() {
        let url = validate_source_url("https://cdn.example.com/video.mp4").unwrap();
        assert!(DisabledProbe.probe(&url).await.is_none());
    }

    #[tokio::test]
    async fn disabled_config_never_probes() {
        let config = Config {
            probe_enabled: false,
            ffprobe_path: "/nonexistent/streamgate-ffprobe".to_string(),
            ..Config::default()
        };
        let url = validate_source_url("https://cdn.example.com/video.mp4").unwrap();
        assert!(from_config(&config).probe(&url).await.is_none());
    }
}
