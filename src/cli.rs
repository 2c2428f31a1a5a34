use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mediaforge")]
#[command(author, version, about = "Streaming media download and transcode service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print media metadata for a URL
    Probe {
        /// Media URL
        url: String,

        /// Print the raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Transcode a URL to a local file, logging progress
    Transcode {
        /// Media URL
        url: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Output selection for `transcode`.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Extract audio instead of re-encoding video
    #[arg(long)]
    pub audio: bool,

    /// Video container: mp4, webm
    #[arg(short, long, conflicts_with = "audio")]
    pub format: Option<String>,

    /// Video codec: h264, vp9, av1
    #[arg(long, conflicts_with = "audio")]
    pub vcodec: Option<String>,

    /// Video quality: 2160p, 1440p, 1080p, 720p, 480p, 360p
    #[arg(short, long, conflicts_with = "audio")]
    pub quality: Option<String>,

    /// Audio codec: mp3, opus
    #[arg(long, requires = "audio")]
    pub codec: Option<String>,

    /// Audio bitrate in kbps: 512, 320, 256, 192, 160, 128
    #[arg(long, requires = "audio")]
    pub kbps: Option<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::try_parse_from(["mediaforge"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_transcode_audio_args() {
        let cli = Cli::try_parse_from([
            "mediaforge",
            "transcode",
            "https://example.com/a.mp4",
            "-o",
            "out.mp3",
            "--audio",
            "--kbps",
            "192",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Transcode { target, output, .. }) => {
                assert!(target.audio);
                assert_eq!(target.kbps.as_deref(), Some("192"));
                assert_eq!(output, PathBuf::from("out.mp3"));
            }
            _ => panic!("expected transcode"),
        }
    }

    #[test]
    fn test_audio_and_video_options_conflict() {
        let result = Cli::try_parse_from([
            "mediaforge",
            "transcode",
            "https://example.com/a.mp4",
            "-o",
            "out.mp4",
            "--audio",
            "--format",
            "webm",
        ]);
        assert!(result.is_err());
    }
}
