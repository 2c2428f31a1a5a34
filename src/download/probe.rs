//! Metadata probe: duration, bit rate, streams, title, thumbnail.
//!
//! Video-hosting URLs go through `yt-dlp --dump-json`; everything else through
//! `ffprobe -of json`. Each attempt runs under its own timeout, and the whole
//! probe is wrapped in the deterministic retry policy from
//! `RetryConfig::probe()` (3 attempts, 2s then 4s). Unavailable media is
//! reported as `SourceUnavailable` and never retried.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::process::Command;
use url::Url;

use crate::core::config::{self, AppConfig};
use crate::core::error::AppError;
use crate::core::metrics;
use crate::core::process::run_with_timeout;
use crate::core::retry::{retry, RetryConfig};
use crate::core::validation::is_video_host;
use crate::download::ytdlp_errors;

/// Container-level facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatInfo {
    /// Seconds
    pub duration: Option<f64>,
    /// Bits per second
    pub bit_rate: Option<u64>,
}

/// One elementary stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub codec_type: String,
    pub codec_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Probe result, also the JSON body of the metadata endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
}

impl MediaInfo {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.format.duration.filter(|d| d.is_finite() && *d > 0.0)
    }

    /// `bit_rate × duration / 8`, with `fallback_bit_rate` when the source
    /// reported none. `None` without a duration.
    pub fn estimated_size_bytes(&self, fallback_bit_rate: u64) -> Option<u64> {
        let duration = self.duration_seconds()?;
        let bit_rate = self.format.bit_rate.filter(|b| *b > 0).unwrap_or(fallback_bit_rate);
        Some((bit_rate as f64 * duration / 8.0) as u64)
    }
}

/// Resolves media metadata for a URL.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, url: &Url) -> Result<MediaInfo, AppError>;
}

/// Probe backed by the ffprobe and yt-dlp binaries.
pub struct CommandProbe {
    ffprobe_bin: String,
    ytdl_bin: String,
    cookies_file: Option<PathBuf>,
    retry: RetryConfig,
}

impl CommandProbe {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            ffprobe_bin: config.ffprobe_bin.clone(),
            ytdl_bin: config.ytdl_bin.clone(),
            cookies_file: config.cookies_file.clone(),
            retry: RetryConfig::probe(),
        }
    }

    /// Overrides the retry policy (tests use a zero delay).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn probe_ytdlp(&self, url: &Url) -> Result<MediaInfo, AppError> {
        let mut cmd = Command::new(&self.ytdl_bin);
        cmd.arg(url.as_str())
            .args(["--dump-json", "--no-warnings", "--no-playlist", "--no-save-cookies"])
            .args(["--socket-timeout", "60"]);
        if let Some(cookies) = self.cookies_file.as_ref().filter(|p| p.exists()) {
            cmd.arg("--cookies").arg(cookies);
        }

        let output = run_with_timeout(&mut cmd, &self.ytdl_bin, config::probe::ytdlp_timeout()).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ytdlp_errors::to_app_error(output.status.code(), &stderr));
        }
        parse_ytdlp_json(&output.stdout)
    }

    async fn probe_ffprobe(&self, url: &Url) -> Result<MediaInfo, AppError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args(["-v", "error"])
            .args([
                "-show_entries",
                "format=duration,bit_rate:stream=codec_name,codec_type,width,height",
            ])
            .args(["-of", "json"])
            .arg(url.as_str());

        let output = run_with_timeout(&mut cmd, &self.ffprobe_bin, config::probe::ffprobe_timeout()).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ffprobe_failure(output.status.code(), &stderr));
        }
        parse_ffprobe_json(&output.stdout)
    }
}

#[async_trait]
impl MetadataProbe for CommandProbe {
    async fn probe(&self, url: &Url) -> Result<MediaInfo, AppError> {
        let backend = if is_video_host(url) { "yt-dlp" } else { "ffprobe" };
        log::info!("Probing {} via {}", url, backend);

        let result = retry(&self.retry, move || async move {
            if backend == "yt-dlp" {
                self.probe_ytdlp(url).await
            } else {
                self.probe_ffprobe(url).await
            }
        })
        .await;

        let attempts = result.attempts;
        let outcome = result.into_result();
        let label = match &outcome {
            Ok(_) => "ok",
            Err(AppError::SourceUnavailable(_)) => "unavailable",
            Err(_) => "error",
        };
        metrics::PROBES_TOTAL.with_label_values(&[backend, label]).inc();

        match &outcome {
            Ok(info) => log::info!(
                "Probe ok after {} attempt(s): duration={:?} bit_rate={:?} title={:?}",
                attempts,
                info.format.duration,
                info.format.bit_rate,
                info.title
            ),
            Err(e) => log::warn!("Probe failed after {} attempt(s): {}", attempts, e),
        }
        outcome
    }
}

fn classify_ffprobe_failure(code: Option<i32>, stderr: &str) -> AppError {
    let detail = stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or("ffprobe failed")
        .to_string();
    let lower = stderr.to_lowercase();
    let permanent = lower.contains("server returned 4")
        || lower.contains("invalid data found")
        || lower.contains("no such file")
        || lower.contains("protocol not found");
    log::debug!("ffprobe exited with {:?}: {}", code, detail);
    if permanent {
        AppError::SourceUnavailable(detail)
    } else {
        AppError::Probe(detail)
    }
}

/// Number or numeric string.
fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn as_u32(value: &Value) -> Option<u32> {
    as_f64(value).filter(|v| *v >= 0.0).map(|v| v as u32)
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string).filter(|s| !s.is_empty())
}

/// ffprobe `-of json` output; numbers may arrive as strings.
pub fn parse_ffprobe_json(raw: &[u8]) -> Result<MediaInfo, AppError> {
    let root: Value = serde_json::from_slice(raw)?;
    let format = &root["format"];
    let streams = root["streams"]
        .as_array()
        .map(|streams| {
            streams
                .iter()
                .map(|s| StreamInfo {
                    codec_type: as_string(&s["codec_type"]).unwrap_or_else(|| "unknown".to_string()),
                    codec_name: as_string(&s["codec_name"]),
                    width: as_u32(&s["width"]),
                    height: as_u32(&s["height"]),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(MediaInfo {
        format: FormatInfo {
            duration: as_f64(&format["duration"]),
            bit_rate: as_f64(&format["bit_rate"]).map(|b| b as u64),
        },
        streams,
        title: None,
        thumbnail: None,
    })
}

/// yt-dlp `--dump-json` output.
///
/// The bit rate is estimated in bits/s from `filesize_approx` (or `tbr` in
/// kbit/s). The stream list comes from the first format carrying both video
/// and audio, else the first format.
pub fn parse_ytdlp_json(raw: &[u8]) -> Result<MediaInfo, AppError> {
    let root: Value = serde_json::from_slice(raw)?;
    let duration = as_f64(&root["duration"]).filter(|d| *d > 0.0);
    let Some(duration) = duration else {
        return Err(AppError::Probe("could not extract duration".to_string()));
    };

    let bit_rate = as_f64(&root["filesize_approx"])
        .map(|size| size * 8.0 / duration)
        .or_else(|| as_f64(&root["tbr"]).map(|kbps| kbps * 1000.0))
        .map(|b| b.round() as u64);

    let has = |f: &Value, key: &str| f[key].as_str().is_some_and(|c| c != "none");
    let formats = root["formats"].as_array().map(Vec::as_slice).unwrap_or_default();
    let chosen = formats
        .iter()
        .find(|f| has(f, "vcodec") && has(f, "acodec"))
        .or_else(|| formats.first());

    let mut streams = Vec::new();
    if let Some(f) = chosen {
        if has(f, "vcodec") {
            streams.push(StreamInfo {
                codec_type: "video".to_string(),
                codec_name: as_string(&f["vcodec"]),
                width: as_u32(&f["width"]),
                height: as_u32(&f["height"]),
            });
        }
        if has(f, "acodec") {
            streams.push(StreamInfo {
                codec_type: "audio".to_string(),
                codec_name: as_string(&f["acodec"]),
                width: None,
                height: None,
            });
        }
    }

    Ok(MediaInfo {
        format: FormatInfo {
            duration: Some(duration),
            bit_rate,
        },
        streams,
        title: as_string(&root["title"]),
        thumbnail: as_string(&root["thumbnail"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ffprobe_coerces_strings() {
        let raw = br#"{
            "streams": [
                {"codec_name": "h264", "codec_type": "video", "width": 1920, "height": "1080"},
                {"codec_name": "aac", "codec_type": "audio"}
            ],
            "format": {"duration": "12.500000", "bit_rate": "2500000"}
        }"#;
        let info = parse_ffprobe_json(raw).unwrap();
        assert_eq!(info.format.duration, Some(12.5));
        assert_eq!(info.format.bit_rate, Some(2_500_000));
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.streams[0].height, Some(1080));
        assert_eq!(info.streams[1].width, None);
        assert_eq!(info.title, None);
    }

    #[test]
    fn test_parse_ffprobe_missing_format() {
        let info = parse_ffprobe_json(br#"{"streams": []}"#).unwrap();
        assert_eq!(info.duration_seconds(), None);
        assert!(parse_ffprobe_json(b"not json").is_err());
    }

    #[test]
    fn test_parse_ytdlp_estimates_bits_per_second() {
        let raw = br#"{
            "title": "Demo",
            "thumbnail": "https://i.ytimg.com/vi/abc/hq.jpg",
            "duration": 100,
            "filesize_approx": 12500000,
            "formats": [
                {"vcodec": "none", "acodec": "opus"},
                {"vcodec": "avc1.64001F", "acodec": "mp4a.40.2", "width": 1280, "height": 720}
            ]
        }"#;
        let info = parse_ytdlp_json(raw).unwrap();
        assert_eq!(info.format.bit_rate, Some(1_000_000));
        assert_eq!(info.title.as_deref(), Some("Demo"));
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.streams[0].codec_type, "video");
        assert_eq!(info.streams[0].height, Some(720));
        assert_eq!(info.estimated_size_bytes(0), Some(12_500_000));
    }

    #[test]
    fn test_parse_ytdlp_requires_duration() {
        let err = parse_ytdlp_json(br#"{"title": "live", "formats": []}"#).unwrap_err();
        assert!(matches!(err, AppError::Probe(_)));
    }

    #[test]
    fn test_estimated_size_uses_fallback_bit_rate() {
        let info = MediaInfo {
            format: FormatInfo {
                duration: Some(80.0),
                bit_rate: None,
            },
            ..Default::default()
        };
        assert_eq!(
            info.estimated_size_bytes(config::size::FALLBACK_BIT_RATE),
            Some(25_000_000)
        );
        assert_eq!(MediaInfo::default().estimated_size_bytes(1), None);
    }

    #[test]
    fn test_classify_ffprobe_failure() {
        assert!(matches!(
            classify_ffprobe_failure(Some(1), "https://x/a.mp4: Server returned 404 Not Found"),
            AppError::SourceUnavailable(_)
        ));
        assert!(matches!(
            classify_ffprobe_failure(Some(1), "Connection timed out"),
            AppError::Probe(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_probe_binary_is_not_retried() {
        let config = AppConfig {
            ffprobe_bin: "definitely-not-ffprobe-mediaforge".into(),
            ..AppConfig::default()
        };
        let probe = CommandProbe::new(&config);
        let started = std::time::Instant::now();
        let err = probe
            .probe(&Url::parse("https://cdn.example.com/a.mp4").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    /// ffprobe stand-in that fails `failures` times with `stderr`, then prints
    /// valid JSON. Each run bumps a counter file next to the script.
    fn counting_ffprobe(dir: &tempfile::TempDir, failures: u32, stderr: &str) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("ffprobe");
        let counter = dir.path().join("attempts");
        let body = format!(
            "#!/bin/sh\n\
             n=$(cat '{counter}' 2>/dev/null || echo 0)\n\
             n=$((n+1))\n\
             echo $n > '{counter}'\n\
             if [ $n -le {failures} ]; then echo '{stderr}' >&2; exit 1; fi\n\
             echo '{{\"format\":{{\"duration\":\"12.5\",\"bit_rate\":\"800000\"}},\"streams\":[]}}'\n",
            counter = counter.display(),
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), counter)
    }

    fn attempts(counter: &std::path::Path) -> u32 {
        std::fs::read_to_string(counter).unwrap().trim().parse().unwrap()
    }

    fn fast_probe(ffprobe_bin: String) -> CommandProbe {
        let config = AppConfig {
            ffprobe_bin,
            ..AppConfig::default()
        };
        CommandProbe::new(&config).with_retry(RetryConfig::probe().initial_delay(std::time::Duration::from_millis(5)))
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_transient_probe_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, counter) = counting_ffprobe(&dir, 2, "Connection timed out");

        let info = fast_probe(bin)
            .probe(&Url::parse("https://cdn.example.com/a.mp4").unwrap())
            .await
            .unwrap();
        assert_eq!(info.duration_seconds(), Some(12.5));
        assert_eq!(info.format.bit_rate, Some(800_000));
        assert_eq!(attempts(&counter), 3);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_unavailable_source_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, counter) = counting_ffprobe(&dir, 5, "Server returned 404 Not Found");

        let err = fast_probe(bin)
            .probe(&Url::parse("https://cdn.example.com/gone.mp4").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)), "got {:?}", err);
        assert_eq!(attempts(&counter), 1);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, counter) = counting_ffprobe(&dir, 10, "Connection timed out");

        let err = fast_probe(bin)
            .probe(&Url::parse("https://cdn.example.com/a.mp4").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Probe(_)), "got {:?}", err);
        assert_eq!(attempts(&counter), config::probe::MAX_ATTEMPTS);
    }
}
