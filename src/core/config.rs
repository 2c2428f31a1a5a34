//! Configuration read from the environment
//!
//! Every value is read once on first access. The server never reads these
//! statics directly: `AppConfig::from_env()` snapshots them into a value that is
//! passed down explicitly, so tests can build their own `AppConfig`.

use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// HTTP listen port
/// Read from PORT environment variable
/// Default: 5050
pub static PORT: Lazy<u16> = Lazy::new(|| env_parse("PORT", 5050));

/// Listen address
/// Read from BIND_ADDR environment variable
/// Default: 0.0.0.0
pub static BIND_ADDR: Lazy<String> = Lazy::new(|| env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Image size ceiling in MiB
pub static MAX_IMAGE_MB: Lazy<u64> = Lazy::new(|| env_parse("MAX_IMAGE_MB", 100));

/// Video/audio source size ceiling in MiB
pub static MAX_VIDEO_MB: Lazy<u64> = Lazy::new(|| env_parse("MAX_VIDEO_MB", 2048));

/// Hostname allow-list (comma-separated)
/// Read from ALLOWED_HOSTS environment variable
/// Empty list means every host is allowed
pub static ALLOWED_HOSTS: Lazy<Vec<String>> = Lazy::new(|| {
    env::var("ALLOWED_HOSTS")
        .ok()
        .map(|raw| parse_host_list(&raw))
        .unwrap_or_default()
});

/// Maximum number of transcodes running at once
pub static MAX_CONCURRENT_TRANSCODES: Lazy<usize> = Lazy::new(|| env_parse::<usize>("MAX_CONCURRENT_TRANSCODES", 4).max(1));

/// ffmpeg binary path
/// Read from FFMPEG_BIN environment variable or defaults to "ffmpeg"
pub static FFMPEG_BIN: Lazy<String> = Lazy::new(|| env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()));

/// ffprobe binary path
pub static FFPROBE_BIN: Lazy<String> =
    Lazy::new(|| env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()));

/// Cached yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| {
    env::var("YTDL_BIN").unwrap_or_else(|_| {
        if cfg!(windows) {
            "yt-dlp.exe".to_string()
        } else {
            "yt-dlp".to_string()
        }
    })
});

/// Path to cookies file passed to yt-dlp
/// Read from YTDL_COOKIES_FILE environment variable
/// Supports tilde (~) expansion for home directory
pub static YTDL_COOKIES_FILE: Lazy<Option<PathBuf>> = Lazy::new(|| {
    env::var("YTDL_COOKIES_FILE")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(|raw| PathBuf::from(shellexpand::tilde(&raw).to_string()))
});

/// Static UI directory served for unmatched routes
pub static STATIC_DIR: Lazy<PathBuf> =
    Lazy::new(|| PathBuf::from(env::var("STATIC_DIR").unwrap_or_else(|_| "public".to_string())));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: mediaforge.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "mediaforge.log".to_string()));

/// Seconds a finished job stays visible to progress subscribers
pub static JOB_RETENTION_SECS: Lazy<u64> = Lazy::new(|| env_parse("JOB_RETENTION_SECS", 60));

/// Splits a comma-separated host list, lowercasing and dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

/// Metadata probe configuration
pub mod probe {
    use super::Duration;

    /// Timeout for a single ffprobe run (in seconds)
    pub const FFPROBE_TIMEOUT_SECS: u64 = 30;

    /// Timeout for a single `yt-dlp --dump-json` run (in seconds)
    pub const YTDLP_TIMEOUT_SECS: u64 = 60;

    /// Total attempts for one probe (1 initial + retries)
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Delay before the first retry; doubles for each further retry
    pub const RETRY_BASE_DELAY_SECS: u64 = 2;

    pub fn ffprobe_timeout() -> Duration {
        Duration::from_secs(FFPROBE_TIMEOUT_SECS)
    }

    pub fn ytdlp_timeout() -> Duration {
        Duration::from_secs(YTDLP_TIMEOUT_SECS)
    }

    pub fn retry_base_delay() -> Duration {
        Duration::from_secs(RETRY_BASE_DELAY_SECS)
    }
}

/// Transcode pipeline configuration
pub mod transcode {
    use super::Duration;

    /// Hard deadline for one pipeline run (in seconds)
    pub const MAX_DURATION_SECS: u64 = 3 * 60 * 60;

    /// How long ffmpeg may keep running after its input failed before it is killed
    pub const INPUT_FAILURE_GRACE_SECS: u64 = 5;

    /// Read buffer for subprocess stdout / stderr
    pub const READ_CHUNK_BYTES: usize = 64 * 1024;

    /// Output chunks buffered between the pipeline and the HTTP response
    pub const OUTPUT_CHANNEL_DEPTH: usize = 16;

    /// Bytes of diagnostic output kept for error messages
    pub const DIAGNOSTIC_TAIL_BYTES: usize = 2048;

    pub fn max_duration() -> Duration {
        Duration::from_secs(MAX_DURATION_SECS)
    }

    pub fn input_failure_grace() -> Duration {
        Duration::from_secs(INPUT_FAILURE_GRACE_SECS)
    }
}

/// Progress broadcast configuration
pub mod progress {
    use super::Duration;

    /// Events buffered per subscriber before new ones are dropped for it
    pub const SUBSCRIBER_CHANNEL_DEPTH: usize = 64;

    /// SSE keep-alive interval (in seconds)
    pub const KEEP_ALIVE_SECS: u64 = 15;

    pub fn keep_alive() -> Duration {
        Duration::from_secs(KEEP_ALIVE_SECS)
    }
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// User agent for upstream requests
    pub const USER_AGENT: &str = "MediaDownloader/1.0";

    /// Connect timeout for upstream requests (in seconds)
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    pub fn connect_timeout() -> Duration {
        Duration::from_secs(CONNECT_TIMEOUT_SECS)
    }

    /// Whole-request timeout for HEAD checks (in seconds). Streaming GETs have none.
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub fn request_timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}

/// Size estimation configuration
pub mod size {
    /// Bit-rate assumed for downloader sources that report none (2.5 Mbit/s)
    pub const FALLBACK_BIT_RATE: u64 = 2_500_000;

    pub const BYTES_PER_MB: u64 = 1024 * 1024;
}

/// Runtime configuration handed to the server and the download service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub allowed_hosts: Vec<String>,
    pub max_concurrent_transcodes: usize,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub ytdl_bin: String,
    pub cookies_file: Option<PathBuf>,
    pub static_dir: PathBuf,
    pub job_retention: Duration,
    pub head_timeout: Duration,
}

impl AppConfig {
    /// Snapshot the environment-driven statics.
    pub fn from_env() -> Self {
        Self {
            bind_addr: BIND_ADDR.clone(),
            port: *PORT,
            max_image_bytes: MAX_IMAGE_MB.saturating_mul(size::BYTES_PER_MB),
            max_video_bytes: MAX_VIDEO_MB.saturating_mul(size::BYTES_PER_MB),
            allowed_hosts: ALLOWED_HOSTS.clone(),
            max_concurrent_transcodes: *MAX_CONCURRENT_TRANSCODES,
            ffmpeg_bin: FFMPEG_BIN.clone(),
            ffprobe_bin: FFPROBE_BIN.clone(),
            ytdl_bin: YTDL_BIN.clone(),
            cookies_file: YTDL_COOKIES_FILE.clone(),
            static_dir: STATIC_DIR.clone(),
            job_retention: Duration::from_secs(*JOB_RETENTION_SECS),
            head_timeout: network::request_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5050,
            max_image_bytes: 100 * size::BYTES_PER_MB,
            max_video_bytes: 2048 * size::BYTES_PER_MB,
            allowed_hosts: Vec::new(),
            max_concurrent_transcodes: 4,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            ytdl_bin: "yt-dlp".to_string(),
            cookies_file: None,
            static_dir: PathBuf::from("public"),
            job_retention: Duration::from_secs(60),
            head_timeout: network::request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_list() {
        assert_eq!(
            parse_host_list(" Example.com, ,cdn.example.org "),
            vec!["example.com".to_string(), "cdn.example.org".to_string()]
        );
        assert!(parse_host_list("").is_empty());
    }

    #[test]
    fn test_default_config_limits() {
        let config = AppConfig::default();
        assert_eq!(config.max_image_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_video_bytes, 2048 * 1024 * 1024);
        assert_eq!(config.max_concurrent_transcodes, 4);
        assert!(config.allowed_hosts.is_empty());
    }
}
