//! YtDlpSource: video-hosting pages fetched by a yt-dlp subprocess.
//!
//! yt-dlp writes the selected stream to its stdout (`-o -`), which becomes the
//! pipeline input. Its stderr carries `[download]  NN.N%` lines, parsed as the
//! downloading-source phase. The child is spawned with `kill_on_drop`, so
//! dropping the returned `SourceCompletion` tears it down.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use url::Url;

use crate::core::error::AppError;
use crate::core::validation::is_video_host;
use crate::download::presets::{OutputTarget, TranscodeRequest};
use crate::download::progress::{drain_diagnostics, Phase, ProgressCallback};
use crate::download::source::{InputSource, ResolvedSource, SourceCompletion};

/// Source powered by the external yt-dlp downloader.
pub struct YtDlpSource {
    bin: String,
    cookies_file: Option<PathBuf>,
}

impl YtDlpSource {
    pub fn new(bin: impl Into<String>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            cookies_file,
        }
    }

    /// Stream selector: best stream at or below the target height, or best audio.
    pub fn format_selector(target: &OutputTarget) -> String {
        match target.max_height() {
            Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"),
            None => "bestaudio[ext=m4a]/bestaudio/best".to_string(),
        }
    }

    /// Full argument list for streaming `url` to stdout.
    pub fn build_args(&self, url: &Url, target: &OutputTarget) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-warnings".into(),
            "--no-playlist".into(),
            "--newline".into(),
            "--progress".into(),
            "-f".into(),
            Self::format_selector(target),
            "-o".into(),
            "-".into(),
        ];
        if let Some(cookies) = self.cookies_file.as_ref().filter(|p| p.exists()) {
            args.push("--cookies".into());
            args.push(cookies.display().to_string());
        }
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl InputSource for YtDlpSource {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn supports_url(&self, url: &Url) -> bool {
        is_video_host(url)
    }

    async fn open(&self, request: &TranscodeRequest, on_progress: ProgressCallback) -> Result<ResolvedSource, AppError> {
        let args = self.build_args(&request.url, &request.target);
        log::debug!("Spawning {} {}", self.bin, args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AppError::Spawn {
                program: self.bin.clone(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(AppError::Spawn {
                program: self.bin.clone(),
                source: std::io::Error::other("stdio not captured"),
            });
        };

        let diagnostics = tokio::spawn(drain_diagnostics(stderr, Phase::DownloadingSource, on_progress));

        Ok(ResolvedSource {
            origin: "yt-dlp",
            reader: Box::new(stdout),
            completion: SourceCompletion::Process {
                program: self.bin.clone(),
                child,
                diagnostics,
            },
        })
    }
}
