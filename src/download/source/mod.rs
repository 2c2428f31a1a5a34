//! Input source abstraction for the transcode pipeline.
//!
//! An `InputSource` turns a URL into a readable byte stream of raw media. The
//! `SourceResolver` picks the source by hostname, in registration order.
//!
//! Built-in sources:
//! - `YtDlpSource`: video-hosting sites, via a yt-dlp subprocess writing to stdout
//! - `HttpSource`: any other http(s) URL, via a streaming GET

pub mod http;
pub mod ytdlp;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use url::Url;

use crate::core::config::AppConfig;
use crate::core::error::AppError;
use crate::core::process::DiagnosticTail;
use crate::download::presets::TranscodeRequest;
use crate::download::progress::ProgressCallback;
use crate::download::ytdlp_errors;

/// Raw media bytes from a source.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// How a source finishes once its reader is drained.
pub enum SourceCompletion {
    /// Nothing to wait for (direct fetch)
    Immediate,
    /// A downloader subprocess whose exit status decides success
    Process {
        program: String,
        child: Child,
        diagnostics: JoinHandle<DiagnosticTail>,
    },
}

impl SourceCompletion {
    /// Waits for the source to finish after its output was fully read.
    ///
    /// A downloader that exits non-zero fails here even though its bytes were
    /// already consumed.
    pub async fn wait(self) -> Result<(), AppError> {
        let SourceCompletion::Process {
            program,
            mut child,
            diagnostics,
        } = self
        else {
            return Ok(());
        };

        let status = child.wait().await?;
        let tail = diagnostics.await.unwrap_or_else(|e| {
            log::warn!("{} diagnostics task ended abnormally: {}", program, e);
            DiagnosticTail::new(0)
        });

        if status.success() {
            log::debug!("{} exited cleanly", program);
            return Ok(());
        }
        Err(ytdlp_errors::to_app_error(status.code(), &tail.into_string()))
    }
}

/// A resolved, open input stream.
pub struct ResolvedSource {
    /// Source name for logs ("http", "yt-dlp")
    pub origin: &'static str,
    pub reader: SourceReader,
    pub completion: SourceCompletion,
}

impl ResolvedSource {
    pub fn direct(origin: &'static str, reader: SourceReader) -> Self {
        Self {
            origin,
            reader,
            completion: SourceCompletion::Immediate,
        }
    }

    /// Splits into the byte stream and the completion to await after it ends.
    /// Dropping the completion kills a downloader subprocess.
    pub fn into_parts(self) -> (SourceReader, SourceCompletion) {
        (self.reader, self.completion)
    }
}

/// A backend able to open a byte stream for a URL.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Human-readable name of this source (e.g., "yt-dlp", "http")
    fn name(&self) -> &str;

    /// Whether this source handles the given URL.
    fn supports_url(&self, url: &Url) -> bool;

    /// Opens the stream. Download-phase progress, if any, goes to `on_progress`.
    async fn open(&self, request: &TranscodeRequest, on_progress: ProgressCallback)
        -> Result<ResolvedSource, AppError>;
}

/// Routes URLs to the first source that claims them.
pub struct SourceResolver {
    sources: Vec<Arc<dyn InputSource>>,
}

impl SourceResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Register a source. Sources are tried in insertion order.
    pub fn register(&mut self, source: Arc<dyn InputSource>) {
        self.sources.push(source);
    }

    /// Find the first source that supports the given URL.
    pub fn find(&self, url: &Url) -> Option<Arc<dyn InputSource>> {
        self.sources.iter().find(|s| s.supports_url(url)).cloned()
    }

    /// Resolves the request to an open byte stream.
    pub async fn resolve(
        &self,
        request: &TranscodeRequest,
        on_progress: ProgressCallback,
    ) -> Result<ResolvedSource, AppError> {
        let source = self
            .find(&request.url)
            .ok_or_else(|| AppError::Unsupported(format!("no source for {}", request.url)))?;
        log::info!("Resolving {} via {}", request.url, source.name());
        source.open(request, on_progress).await
    }

    /// Default resolver: yt-dlp for video-hosting sites, HTTP for the rest.
    pub fn from_config(config: &AppConfig, client: reqwest::Client) -> Self {
        let mut resolver = Self::new();
        resolver.register(Arc::new(ytdlp::YtDlpSource::new(
            config.ytdl_bin.clone(),
            config.cookies_file.clone(),
        )));
        resolver.register(Arc::new(http::HttpSource::new(client)));
        resolver
    }
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::new()
    }
}
