//! Request validation utilities
//!
//! Everything here runs before any network or subprocess activity:
//! - URL shape checks (http/https only)
//! - Hostname allow-list
//! - Video-hosting hostname recognition (routes to the external downloader)
//! - Content-type classification for image / video / audio
//! - Quality tier and audio bitrate normalization

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::core::error::AppError;

#[allow(clippy::expect_used)]
static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://\S+$").expect("Failed to compile URL regex"));

const IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/avif",
    "image/bmp",
    "image/tiff",
    "image/svg+xml",
];

const VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm", "video/ogg", "video/quicktime", "video/x-matroska"];

const AUDIO_TYPES: &[&str] = &["audio/mpeg", "audio/webm", "audio/ogg", "audio/aac", "audio/wav", "audio/mp4"];

/// Video-hosting domains whose pages are resolved through yt-dlp.
const VIDEO_HOST_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "youtube-nocookie.com"];

/// Parses a user-supplied URL, accepting only http(s) with a host.
///
/// # Examples
/// ```
/// use mediaforge::core::validation::parse_media_url;
///
/// assert!(parse_media_url("https://cdn.example.com/clip.mp4").is_ok());
/// assert!(parse_media_url("ftp://example.com/clip.mp4").is_err());
/// assert!(parse_media_url("https://example.com/a b").is_err());
/// ```
pub fn parse_media_url(raw: &str) -> Result<Url, AppError> {
    if !URL_PATTERN.is_match(raw) {
        return Err(AppError::InvalidUrl);
    }
    let url = Url::parse(raw).map_err(|_| AppError::InvalidUrl)?;
    if url.host_str().is_none() {
        return Err(AppError::InvalidUrl);
    }
    Ok(url)
}

/// Checks the URL host against the allow-list. An empty list allows every host.
///
/// A listed host also admits its subdomains.
pub fn is_allowed_host(url: &Url, allowed_hosts: &[String]) -> bool {
    if allowed_hosts.is_empty() {
        return true;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    allowed_hosts
        .iter()
        .any(|allowed| domain_matches(&host, &allowed.to_lowercase()))
}

/// Full request gate: URL shape first, then the allow-list.
pub fn validate_request_url(raw: Option<&str>, allowed_hosts: &[String]) -> Result<Url, AppError> {
    let raw = raw.ok_or(AppError::InvalidUrl)?;
    let url = parse_media_url(raw)?;
    if !is_allowed_host(&url, allowed_hosts) {
        return Err(AppError::HostNotAllowed);
    }
    Ok(url)
}

/// True when the URL belongs to a video-hosting site (hostname match only).
pub fn is_video_host(url: &Url) -> bool {
    url.host_str()
        .map(|host| {
            let host = host.to_lowercase();
            VIDEO_HOST_DOMAINS.iter().any(|d| domain_matches(&host, d))
        })
        .unwrap_or(false)
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.'))
}

/// Lowercased MIME essence without parameters (`"image/PNG; q=1"` → `"image/png"`).
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

pub fn is_likely_image(content_type: &str) -> bool {
    IMAGE_TYPES.contains(&mime_essence(content_type).as_str())
}

pub fn is_likely_video(content_type: &str) -> bool {
    VIDEO_TYPES.contains(&mime_essence(content_type).as_str())
}

pub fn is_likely_audio(content_type: &str) -> bool {
    AUDIO_TYPES.contains(&mime_essence(content_type).as_str())
}

/// File extension (with dot) for a known image type, empty otherwise.
pub fn ext_from_content_type(content_type: &str) -> &'static str {
    match mime_essence(content_type).as_str() {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/avif" => ".avif",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "image/svg+xml" => ".svg",
        _ => "",
    }
}

/// Output resolution tier. Unknown labels fall back to 1080p.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityTier {
    P2160,
    P1440,
    #[default]
    P1080,
    P720,
    P480,
    P360,
}

impl QualityTier {
    /// Parse from a request label such as `"720p"`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "2160p" => Self::P2160,
            "1440p" => Self::P1440,
            "1080p" => Self::P1080,
            "720p" => Self::P720,
            "480p" => Self::P480,
            "360p" => Self::P360,
            other => {
                log::debug!("Unknown quality '{}', using 1080p", other);
                Self::P1080
            }
        }
    }

    /// Output vertical resolution in pixels.
    pub fn height(&self) -> u32 {
        match self {
            Self::P2160 => 2160,
            Self::P1440 => 1440,
            Self::P1080 => 1080,
            Self::P720 => 720,
            Self::P480 => 480,
            Self::P360 => 360,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::P2160 => "2160p",
            Self::P1440 => "1440p",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
        }
    }
}

/// Audio bitrates (kbps) accepted by the audio endpoint.
pub const ALLOWED_AUDIO_KBPS: &[u32] = &[512, 320, 256, 192, 160, 128];

/// Default audio bitrate used for unknown requests.
pub const DEFAULT_AUDIO_KBPS: u32 = 320;

/// Normalizes a requested audio bitrate; anything not allowed becomes 320.
pub fn normalize_audio_kbps(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return DEFAULT_AUDIO_KBPS;
    };
    match raw.trim().trim_end_matches(['k', 'K']).parse::<u32>() {
        Ok(kbps) if ALLOWED_AUDIO_KBPS.contains(&kbps) => kbps,
        _ => {
            log::warn!("Invalid bitrate {}k; clamping to {}k", raw, DEFAULT_AUDIO_KBPS);
            DEFAULT_AUDIO_KBPS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    // ==================== URL shape ====================

    #[test]
    fn test_parse_media_url_valid() {
        for raw in [
            "https://example.com/video.mp4",
            "http://example.com/a?b=c#frag",
            "HTTPS://EXAMPLE.COM/x.png",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        ] {
            assert!(parse_media_url(raw).is_ok(), "should accept {}", raw);
        }
    }

    #[test]
    fn test_parse_media_url_invalid() {
        for raw in ["", "not a url", "ftp://example.com/file", "https://", "javascript:alert(1)"] {
            assert!(parse_media_url(raw).is_err(), "should reject {:?}", raw);
        }
    }

    // ==================== Allow-list ====================

    #[test]
    fn test_allow_list_empty_allows_all() {
        assert!(is_allowed_host(&url("https://anything.example/x"), &[]));
    }

    #[test]
    fn test_allow_list_matches_host_and_subdomains() {
        let allowed = vec!["example.com".to_string()];
        assert!(is_allowed_host(&url("https://example.com/x"), &allowed));
        assert!(is_allowed_host(&url("https://cdn.EXAMPLE.com/x"), &allowed));
        assert!(!is_allowed_host(&url("https://badexample.com/x"), &allowed));
        assert!(!is_allowed_host(&url("https://example.com.evil.org/x"), &allowed));
    }

    #[test]
    fn test_validate_request_url_order() {
        let allowed = vec!["example.com".to_string()];
        assert!(matches!(
            validate_request_url(None, &allowed),
            Err(AppError::InvalidUrl)
        ));
        assert!(matches!(
            validate_request_url(Some("nope"), &allowed),
            Err(AppError::InvalidUrl)
        ));
        assert!(matches!(
            validate_request_url(Some("https://other.org/a.mp4"), &allowed),
            Err(AppError::HostNotAllowed)
        ));
        assert!(validate_request_url(Some("https://example.com/a.mp4"), &allowed).is_ok());
    }

    // ==================== Video hosts ====================

    #[test]
    fn test_is_video_host() {
        assert!(is_video_host(&url("https://www.youtube.com/watch?v=abc")));
        assert!(is_video_host(&url("https://youtu.be/abc")));
        assert!(is_video_host(&url("https://music.youtube.com/watch?v=abc")));
        assert!(!is_video_host(&url("https://cdn.example.com/youtube.com/video.mp4")));
        assert!(!is_video_host(&url("https://notyoutube.com/watch")));
    }

    // ==================== Content types ====================

    #[test]
    fn test_content_type_classification() {
        assert!(is_likely_image("image/PNG; charset=binary"));
        assert!(!is_likely_image("text/html"));
        assert!(is_likely_video("video/mp4"));
        assert!(is_likely_audio("audio/mpeg"));
        assert!(!is_likely_video("audio/mpeg"));
        assert!(!is_likely_audio(""));
    }

    #[test]
    fn test_ext_from_content_type() {
        assert_eq!(ext_from_content_type("image/jpeg"), ".jpg");
        assert_eq!(ext_from_content_type("image/svg+xml; charset=utf-8"), ".svg");
        assert_eq!(ext_from_content_type("application/octet-stream"), "");
    }

    // ==================== Quality / bitrate ====================

    #[test]
    fn test_quality_tier_mapping() {
        assert_eq!(QualityTier::parse("720p").height(), 720);
        assert_eq!(QualityTier::parse("2160p").height(), 2160);
        assert_eq!(QualityTier::parse("8k").height(), 1080);
        assert_eq!(QualityTier::parse("").label(), "1080p");
    }

    #[test]
    fn test_normalize_audio_kbps() {
        assert_eq!(normalize_audio_kbps(Some("192")), 192);
        assert_eq!(normalize_audio_kbps(Some("128k")), 128);
        assert_eq!(normalize_audio_kbps(Some("999")), 320);
        assert_eq!(normalize_audio_kbps(Some("abc")), 320);
        assert_eq!(normalize_audio_kbps(None), 320);
    }
}
