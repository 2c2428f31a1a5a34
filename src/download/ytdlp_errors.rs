//! Classification of yt-dlp failures from its diagnostic output.
//!
//! Used by both the metadata probe (`--dump-json`) and the source downloader
//! to turn a non-zero exit into the matching `AppError`, and to decide whether
//! a probe attempt is worth repeating.

use crate::core::error::AppError;

/// Kinds of yt-dlp failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YtDlpErrorType {
    /// Cookies are invalid or have been rotated
    InvalidCookies,
    /// The site flagged the request as automated
    BotDetection,
    /// Media is private, removed or region-locked
    VideoUnavailable,
    /// Timeouts, resets, DNS
    NetworkError,
    /// Anything else
    Unknown,
}

/// Inspects yt-dlp stderr and picks the failure kind.
pub fn analyze_ytdlp_error(stderr: &str) -> YtDlpErrorType {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("cookies are no longer valid")
        || stderr_lower.contains("cookies have likely been rotated")
        || stderr_lower.contains("use --cookies-from-browser")
        || stderr_lower.contains("use --cookies for the authentication")
    {
        return YtDlpErrorType::InvalidCookies;
    }

    if stderr_lower.contains("sign in to confirm you're not a bot")
        || stderr_lower.contains("sign in to confirm you’re not a bot")
        || stderr_lower.contains("bot detection")
        || stderr_lower.contains("http error 403")
        || stderr_lower.contains("signature extraction failed")
    {
        return YtDlpErrorType::BotDetection;
    }

    if stderr_lower.contains("private video")
        || stderr_lower.contains("video unavailable")
        || stderr_lower.contains("this video is not available")
        || stderr_lower.contains("video is private")
        || stderr_lower.contains("video has been removed")
        || stderr_lower.contains("this video does not exist")
        || stderr_lower.contains("not available in your country")
    {
        return YtDlpErrorType::VideoUnavailable;
    }

    if stderr_lower.contains("timed out")
        || stderr_lower.contains("timeout")
        || stderr_lower.contains("connection reset")
        || stderr_lower.contains("failed to connect")
        || stderr_lower.contains("temporary failure in name resolution")
        || stderr_lower.contains("network is unreachable")
    {
        return YtDlpErrorType::NetworkError;
    }

    YtDlpErrorType::Unknown
}

impl YtDlpErrorType {
    /// Client-facing message.
    pub fn user_message(&self) -> &'static str {
        match self {
            YtDlpErrorType::InvalidCookies | YtDlpErrorType::BotDetection => {
                "The video site refused the request. Try again later or try another video."
            }
            YtDlpErrorType::VideoUnavailable => "Video unavailable. It may be private, removed or region-locked.",
            YtDlpErrorType::NetworkError => "Network problem while contacting the video site.",
            YtDlpErrorType::Unknown => "Could not fetch the video. Check that the link is correct.",
        }
    }

    /// Operator hint, logged next to the failure.
    pub fn fix_recommendation(&self) -> Option<&'static str> {
        match self {
            YtDlpErrorType::InvalidCookies => {
                Some("Re-export cookies in Netscape format and point YTDL_COOKIES_FILE at the new file")
            }
            YtDlpErrorType::BotDetection => Some("Refresh cookies and update yt-dlp to the latest release"),
            YtDlpErrorType::NetworkError => Some("Check outbound connectivity from this host"),
            YtDlpErrorType::VideoUnavailable | YtDlpErrorType::Unknown => None,
        }
    }

    /// Only network trouble is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, YtDlpErrorType::NetworkError)
    }

    /// The media itself can't be used, as opposed to the tool failing.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            YtDlpErrorType::InvalidCookies | YtDlpErrorType::BotDetection | YtDlpErrorType::VideoUnavailable
        )
    }
}

/// Maps a failed yt-dlp run to an `AppError` and logs the classification.
///
/// Unavailable media becomes `SourceUnavailable`, network trouble becomes a
/// retryable `Probe` error, everything else a `Downloader` error.
pub fn to_app_error(exit_code: Option<i32>, stderr: &str) -> AppError {
    let kind = analyze_ytdlp_error(stderr);
    log::error!(
        "yt-dlp failed (exit code {:?}, {:?}): {}",
        exit_code,
        kind,
        last_error_line(stderr)
    );
    if let Some(hint) = kind.fix_recommendation() {
        log::warn!("{}", hint);
    }

    if kind.is_source_unavailable() {
        AppError::SourceUnavailable(kind.user_message().to_string())
    } else if kind.is_transient() {
        AppError::Probe(kind.user_message().to_string())
    } else {
        AppError::Downloader {
            code: exit_code,
            detail: last_error_line(stderr),
        }
    }
}

/// The most relevant line of yt-dlp stderr: the last `ERROR:` line if any,
/// otherwise the last non-empty line.
pub fn last_error_line(stderr: &str) -> String {
    let lines = || stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    lines()
        .filter(|l| l.starts_with("ERROR:"))
        .last()
        .or_else(|| lines().last())
        .unwrap_or("no diagnostic output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_bot_detection() {
        let stderr = "ERROR: [youtube] abc: Sign in to confirm you're not a bot. Use --cookies";
        assert_eq!(analyze_ytdlp_error(stderr), YtDlpErrorType::BotDetection);
    }

    #[test]
    fn test_analyze_invalid_cookies() {
        let stderr = "WARNING: The provided YouTube account cookies are no longer valid.";
        assert_eq!(analyze_ytdlp_error(stderr), YtDlpErrorType::InvalidCookies);
    }

    #[test]
    fn test_analyze_unavailable() {
        assert_eq!(
            analyze_ytdlp_error("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            YtDlpErrorType::VideoUnavailable
        );
        assert_eq!(
            analyze_ytdlp_error("ERROR: [youtube] abc: Video unavailable"),
            YtDlpErrorType::VideoUnavailable
        );
    }

    #[test]
    fn test_analyze_network_and_unknown() {
        assert_eq!(
            analyze_ytdlp_error("ERROR: Unable to download webpage: The read operation timed out"),
            YtDlpErrorType::NetworkError
        );
        assert_eq!(analyze_ytdlp_error("ERROR: Unsupported URL"), YtDlpErrorType::Unknown);
    }

    #[test]
    fn test_to_app_error_mapping() {
        assert!(matches!(
            to_app_error(Some(1), "ERROR: Video unavailable"),
            AppError::SourceUnavailable(_)
        ));
        assert!(matches!(
            to_app_error(Some(1), "ERROR: connection reset by peer\nERROR: timed out"),
            AppError::Probe(_)
        ));
        match to_app_error(Some(2), "[generic] x\nERROR: Unsupported URL: https://x\n") {
            AppError::Downloader { code, detail } => {
                assert_eq!(code, Some(2));
                assert_eq!(detail, "ERROR: Unsupported URL: https://x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_last_error_line_fallback() {
        assert_eq!(last_error_line("line one\nline two\n\n"), "line two");
        assert_eq!(last_error_line(""), "no diagnostic output");
    }
}
