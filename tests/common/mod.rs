//! Common test utilities
//!
//! Shell-script stand-ins for ffmpeg / yt-dlp, a fixed metadata probe and a
//! config builder. Shared across all integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

use mediaforge::core::{AppConfig, AppError};
use mediaforge::download::probe::{FormatInfo, MediaInfo, MetadataProbe};

/// ffmpeg stand-in: copies stdin to stdout, reporting progress on stderr.
pub const FFMPEG_OK: &str = r#"#!/bin/sh
echo "frame=   30 fps=30 q=28.0 size=       0kB time=00:00:01.00 bitrate=N/A speed=1.0x" >&2
cat
echo "frame=   60 fps=30 q=28.0 size=       1kB time=00:00:02.00 bitrate= 838.9kbits/s speed=1.1x" >&2
exit 0
"#;

/// ffmpeg stand-in that consumes its input and then fails.
pub const FFMPEG_FAIL: &str = r#"#!/bin/sh
cat > /dev/null
echo "pipe:0: Invalid data found when processing input" >&2
exit 1
"#;

/// ffmpeg stand-in that writes some output, then hangs until killed.
pub const FFMPEG_SLOW: &str = r#"#!/bin/sh
printf 'header'
exec sleep 30
"#;

/// yt-dlp stand-in: reports progress, writes a payload, exits cleanly.
pub const YTDLP_OK: &str = r#"#!/bin/sh
echo "[download]  50.0% of 1.00KiB at 1.00KiB/s ETA 00:01" >&2
printf 'downloaded-bytes'
echo "[download] 100.0% of 1.00KiB at 1.00KiB/s ETA 00:00" >&2
exit 0
"#;

/// yt-dlp stand-in: partial output, then a private-video failure.
pub const YTDLP_PRIVATE: &str = r#"#!/bin/sh
echo "[download]  10.0% of 1.00MiB" >&2
printf 'partial'
echo "ERROR: [youtube] abc: Private video. Sign in if you've been granted access" >&2
exit 1
"#;

/// Writes an executable script into `dir` and returns its path.
pub fn fake_bin(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).expect("write fake binary");
    let mut perms = std::fs::metadata(&path).expect("stat fake binary").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake binary");
    path
}

/// Scratch directory plus a config pointing at it.
pub struct TestEnvironment {
    pub dir: TempDir,
    pub config: AppConfig,
}

impl TestEnvironment {
    /// Binaries default to names that do not exist, so nothing is spawned by accident.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = AppConfig {
            ffmpeg_bin: "definitely-not-ffmpeg-mediaforge".into(),
            ffprobe_bin: "definitely-not-ffprobe-mediaforge".into(),
            ytdl_bin: "definitely-not-yt-dlp-mediaforge".into(),
            static_dir: dir.path().join("public"),
            job_retention: Duration::from_secs(60),
            ..AppConfig::default()
        };
        Self { dir, config }
    }

    pub fn with_ffmpeg(mut self, script: &str) -> Self {
        self.config.ffmpeg_bin = fake_bin(self.dir.path(), "ffmpeg", script).display().to_string();
        self
    }

    pub fn with_ytdlp(mut self, script: &str) -> Self {
        self.config.ytdl_bin = fake_bin(self.dir.path(), "yt-dlp", script).display().to_string();
        self
    }
}

/// Probe that answers without touching the network.
pub struct FixedProbe {
    pub info: MediaInfo,
}

impl FixedProbe {
    pub fn with_duration(duration: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            info: MediaInfo {
                format: FormatInfo {
                    duration,
                    bit_rate: None,
                },
                ..MediaInfo::default()
            },
        })
    }

    pub fn with_bit_rate(duration: f64, bit_rate: u64) -> Arc<Self> {
        Arc::new(Self {
            info: MediaInfo {
                format: FormatInfo {
                    duration: Some(duration),
                    bit_rate: Some(bit_rate),
                },
                ..MediaInfo::default()
            },
        })
    }
}

#[async_trait]
impl MetadataProbe for FixedProbe {
    async fn probe(&self, _url: &Url) -> Result<MediaInfo, AppError> {
        Ok(self.info.clone())
    }
}
