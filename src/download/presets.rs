//! Transcoder argument presets.
//!
//! The argument table is keyed by `(container, codec)`; combinations that are
//! not in the table fail with `AppError::Unsupported` before anything is spawned.
//! Input is always `pipe:0` and output `pipe:1`.

use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use url::Url;

use crate::core::error::AppError;
use crate::core::validation::{normalize_audio_kbps, QualityTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Container {
    Mp4,
    Webm,
}

impl Container {
    /// Codec used when the request names none.
    pub fn default_codec(self) -> VideoCodec {
        match self {
            Container::Mp4 => VideoCodec::H264,
            Container::Webm => VideoCodec::Vp9,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Container::Mp4 => "video/mp4",
            Container::Webm => "video/webm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum VideoCodec {
    H264,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AudioCodec {
    #[default]
    Mp3,
    Opus,
}

impl AudioCodec {
    pub fn content_type(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "audio/mpeg",
            AudioCodec::Opus => "audio/ogg",
        }
    }
}

/// What the transcoder should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    Video {
        container: Container,
        codec: VideoCodec,
        quality: QualityTier,
    },
    Audio {
        codec: AudioCodec,
        kbps: u32,
    },
}

fn parse_choice<T: FromStr>(raw: Option<&str>, what: &str, default: T) -> Result<T, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| AppError::Unsupported(format!("unknown {} '{}'", what, s))),
    }
}

impl OutputTarget {
    /// Resolves video request parameters. Fails on unknown names and on
    /// container/codec pairs with no preset.
    pub fn video(format: Option<&str>, vcodec: Option<&str>, quality: Option<&str>) -> Result<Self, AppError> {
        let container = parse_choice(format, "format", Container::Mp4)?;
        let codec = parse_choice(vcodec, "video codec", container.default_codec())?;
        let target = OutputTarget::Video {
            container,
            codec,
            quality: quality.map(QualityTier::parse).unwrap_or_default(),
        };
        // reject early so nothing downstream sees an unsupported pair
        target.ffmpeg_args()?;
        Ok(target)
    }

    /// Resolves audio request parameters. Unknown bitrates fall back to 320k.
    pub fn audio(codec: Option<&str>, kbps: Option<&str>) -> Result<Self, AppError> {
        Ok(OutputTarget::Audio {
            codec: parse_choice(codec, "audio codec", AudioCodec::Mp3)?,
            kbps: normalize_audio_kbps(kbps),
        })
    }

    /// "video" or "audio", used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            OutputTarget::Video { .. } => "video",
            OutputTarget::Audio { .. } => "audio",
        }
    }

    /// Output height cap for the downloader's stream selection.
    pub fn max_height(&self) -> Option<u32> {
        match self {
            OutputTarget::Video { quality, .. } => Some(quality.height()),
            OutputTarget::Audio { .. } => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputTarget::Video { container, .. } => container.content_type(),
            OutputTarget::Audio { codec, .. } => codec.content_type(),
        }
    }

    /// Attachment filename, e.g. `video_720p.webm` or `audio_192k.mp3`.
    pub fn filename(&self) -> String {
        match self {
            OutputTarget::Video { container, quality, .. } => format!("video_{}.{}", quality.label(), container),
            OutputTarget::Audio { codec, kbps } => format!("audio_{}k.{}", kbps, codec),
        }
    }

    /// Full transcoder argument list for this target.
    pub fn ffmpeg_args(&self) -> Result<Vec<String>, AppError> {
        match *self {
            OutputTarget::Video {
                container,
                codec,
                quality,
            } => video_args(container, codec, quality.height()),
            OutputTarget::Audio { codec, kbps } => Ok(audio_args(codec, kbps)),
        }
    }
}

fn to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// Video preset: fixed pixel format, even-width scaling to `height`, codec-family
/// encoder settings, and a streamable muxer.
pub fn video_args(container: Container, codec: VideoCodec, height: u32) -> Result<Vec<String>, AppError> {
    #[rustfmt::skip]
    let encoder: &[&str] = match (container, codec) {
        (Container::Mp4, VideoCodec::H264) => &[
            "-c:v", "libx264", "-preset", "veryfast", "-profile:v", "high", "-level", "4.2",
            "-c:a", "aac", "-b:a", "192k",
            "-movflags", "+frag_keyframe+empty_moov",
            "-f", "mp4",
        ],
        (Container::Webm, VideoCodec::Vp9) => &[
            "-c:v", "libvpx-vp9", "-b:v", "0", "-crf", "32", "-row-mt", "1", "-cpu-used", "4",
            "-c:a", "libopus", "-b:a", "160k",
            "-f", "webm",
        ],
        (Container::Webm, VideoCodec::Av1) => &[
            "-c:v", "libaom-av1", "-b:v", "0", "-crf", "30", "-cpu-used", "6",
            "-c:a", "libopus", "-b:a", "160k",
            "-f", "webm",
        ],
        (container, codec) => {
            return Err(AppError::Unsupported(format!("{}/{}", container, codec)));
        }
    };

    #[rustfmt::skip]
    let mut args = to_strings(&[
        "-hide_banner", "-y", "-i", "pipe:0",
        "-map", "0:v:0?", "-map", "0:a:0?",
        "-pix_fmt", "yuv420p",
    ]);
    args.push("-vf".to_string());
    args.push(format!("scale=trunc(oh*a/2)*2:{}", height));
    args.extend(to_strings(&["-max_muxing_queue_size", "9999"]));
    args.extend(to_strings(encoder));
    args.push("pipe:1".to_string());
    Ok(args)
}

/// Audio preset: drops video (`-vn`) and passes only audio encoder flags.
pub fn audio_args(codec: AudioCodec, kbps: u32) -> Vec<String> {
    let (encoder, muxer) = match codec {
        AudioCodec::Mp3 => ("libmp3lame", "mp3"),
        AudioCodec::Opus => ("libopus", "opus"),
    };
    let bitrate = format!("{}k", kbps);
    #[rustfmt::skip]
    let args = to_strings(&[
        "-hide_banner", "-y", "-i", "pipe:0", "-vn",
        "-c:a", encoder, "-b:a", &bitrate,
        "-f", muxer, "pipe:1",
    ]);
    args
}

/// Immutable description of one transcode.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub url: Url,
    pub target: OutputTarget,
    pub job_id: Option<String>,
}

impl TranscodeRequest {
    pub fn new(url: Url, target: OutputTarget, job_id: Option<String>) -> Self {
        Self {
            url,
            target,
            job_id: job_id.filter(|id| !id.trim().is_empty()),
        }
    }
}
