//! Per-request glue between the HTTP layer and the pipeline.
//!
//! Pre-flight runs in a fixed order so that cheap rejections never touch the
//! network or spawn anything: URL and allow-list, output target (done by the
//! caller), probe, size ceiling, job registration, admission, source, ffmpeg.
//! Once the output stream is handed out, a supervisor task owns the admission
//! slot until the pipeline is terminal and then finishes the job.

use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;
use url::Url;

use crate::core::config::{self, AppConfig};
use crate::core::error::AppError;
use crate::core::validation::{
    ext_from_content_type, is_likely_audio, is_likely_image, is_likely_video, is_video_host, mime_essence,
    validate_request_url,
};
use crate::download::admission::AdmissionController;
use crate::download::jobs::JobRegistry;
use crate::download::pipeline::{OutputStream, PipelineState, TranscodeOrchestrator, TranscodeOutput};
use crate::download::presets::{OutputTarget, TranscodeRequest};
use crate::download::probe::{CommandProbe, MediaInfo, MetadataProbe};
use crate::download::progress::{ignore_progress, ProgressCallback};
use crate::download::source::http::build_client;
use crate::download::source::SourceResolver;

/// A ready-to-send download: headers plus the body stream.
pub struct MediaDownload {
    pub content_type: String,
    pub filename: String,
    pub stream: OutputStream,
}

impl std::fmt::Debug for MediaDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDownload")
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Upstream answer to a HEAD request.
#[derive(Debug, Clone, Default)]
struct HeadInfo {
    content_type: String,
    content_length: Option<u64>,
}

/// Everything a download request needs, shared across handlers.
#[derive(Clone)]
pub struct DownloadService {
    config: Arc<AppConfig>,
    client: Client,
    probe: Arc<dyn MetadataProbe>,
    resolver: Arc<SourceResolver>,
    orchestrator: TranscodeOrchestrator,
    admission: AdmissionController,
    jobs: JobRegistry,
}

impl DownloadService {
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let client = build_client()?;
        Ok(Self {
            probe: Arc::new(CommandProbe::new(&config)),
            resolver: Arc::new(SourceResolver::from_config(&config, client.clone())),
            orchestrator: TranscodeOrchestrator::new(config.ffmpeg_bin.clone()),
            admission: AdmissionController::new(config.max_concurrent_transcodes),
            jobs: JobRegistry::new(config.job_retention),
            config: Arc::new(config),
            client,
        })
    }

    /// Replaces the metadata probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// URL validity, then the allow-list.
    pub fn validate_url(&self, raw: Option<&str>) -> Result<Url, AppError> {
        validate_request_url(raw, &self.config.allowed_hosts)
    }

    pub async fn probe(&self, raw: Option<&str>) -> Result<MediaInfo, AppError> {
        let url = self.validate_url(raw)?;
        self.probe.probe(&url).await
    }

    /// Image passthrough: the upstream bytes are relayed unmodified.
    pub async fn image(&self, raw: Option<&str>) -> Result<MediaDownload, AppError> {
        let url = self.validate_url(raw)?;
        if is_video_host(&url) {
            return Err(AppError::NotMediaType("Use /api/video for YouTube.".into()));
        }

        let head = self.head(&url).await?;
        if !is_likely_image(&head.content_type) {
            return Err(AppError::NotMediaType("Not an image URL.".into()));
        }
        if head.content_length.is_some_and(|len| len > self.config.max_image_bytes) {
            return Err(AppError::PayloadTooLarge("Image too large.".into()));
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to fetch source: {}", e)))?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(AppError::Upstream(format!("Upstream returned {}", status.as_u16())));
        }

        let content_type = header_str(response.headers(), CONTENT_TYPE).unwrap_or(head.content_type);
        let filename = format!("image{}", ext_from_content_type(&content_type));
        log::info!("Relaying image {} as {} ({})", url, filename, content_type);

        let stream = response.bytes_stream().map_err(AppError::Http);
        Ok(MediaDownload {
            content_type,
            filename,
            stream: Box::pin(stream),
        })
    }

    /// Runs the full pre-flight and starts the pipeline.
    ///
    /// Errors returned here happen before any byte is sent. Later failures end
    /// the returned stream with an `Err` item and mark the job failed.
    pub async fn transcode(&self, request: TranscodeRequest) -> Result<MediaDownload, AppError> {
        // Rejects unsupported pairs before any probing.
        request.target.ffmpeg_args()?;

        let info = self.probe.probe(&request.url).await?;
        self.check_source_size(&request, &info).await?;

        let mut pending = PendingJob::register(&self.jobs, request.job_id.as_deref(), info.duration_seconds());

        let slot = self.admission.acquire().await;
        let on_progress = self.progress_callback(request.job_id.as_deref());

        let output = match self.start_pipeline(&request, on_progress).await {
            Ok(output) => output,
            Err(e) => {
                pending.fail(&e);
                return Err(e);
            }
        };
        let TranscodeOutput { stream, handle } = output;

        let job = pending.hand_off();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let state = handle.wait().await;
            if let Some(job_id) = job {
                let result = match state {
                    PipelineState::Done => Ok(()),
                    PipelineState::Failed(reason) => Err(reason),
                    other => Err(format!("pipeline ended in state {}", other)),
                };
                jobs.mark_done(&job_id, result);
            }
        });

        Ok(MediaDownload {
            content_type: request.target.content_type().to_string(),
            filename: request.target.filename(),
            stream,
        })
    }

    async fn start_pipeline(
        &self,
        request: &TranscodeRequest,
        on_progress: ProgressCallback,
    ) -> Result<TranscodeOutput, AppError> {
        let source = self.resolver.resolve(request, Arc::clone(&on_progress)).await?;
        self.orchestrator.start(request, source, on_progress)
    }

    fn progress_callback(&self, job_id: Option<&str>) -> ProgressCallback {
        match job_id {
            Some(job_id) => {
                let jobs = self.jobs.clone();
                let job_id = job_id.to_string();
                Arc::new(move |event| jobs.update(&job_id, event))
            }
            None => ignore_progress(),
        }
    }

    /// Size ceiling: HEAD for direct sources (which must also look like
    /// media), bit rate × duration for downloader sources.
    async fn check_source_size(&self, request: &TranscodeRequest, info: &MediaInfo) -> Result<(), AppError> {
        let (not_media, too_large) = match request.target {
            OutputTarget::Video { .. } => ("Not a video URL.", "Video too large."),
            OutputTarget::Audio { .. } => ("Not a video/audio URL.", "Source too large."),
        };

        let size = if is_video_host(&request.url) {
            info.estimated_size_bytes(config::size::FALLBACK_BIT_RATE)
        } else {
            let head = self.head(&request.url).await?;
            if !(is_likely_video(&head.content_type) || is_likely_audio(&head.content_type)) {
                return Err(AppError::NotMediaType(not_media.into()));
            }
            head.content_length
        };

        log::debug!(
            "Source size for {}: {} (ceiling {} MiB)",
            request.url,
            size.map(|s| format!("{:.1} MiB", s as f64 / config::size::BYTES_PER_MB as f64))
                .unwrap_or_else(|| "unknown".into()),
            self.config.max_video_bytes / config::size::BYTES_PER_MB
        );

        match size {
            Some(size) if size > self.config.max_video_bytes => Err(AppError::PayloadTooLarge(too_large.into())),
            _ => Ok(()),
        }
    }

    async fn head(&self, url: &Url) -> Result<HeadInfo, AppError> {
        let response = self
            .client
            .head(url.clone())
            .timeout(self.config.head_timeout)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to fetch source: {}", e)))?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(AppError::Upstream(format!("Upstream returned {}", status.as_u16())));
        }

        // reqwest reports a zero length for HEAD bodies; read the header.
        let headers = response.headers();
        Ok(HeadInfo {
            content_type: header_str(headers, CONTENT_TYPE).map(|ct| mime_essence(&ct)).unwrap_or_default(),
            content_length: header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        })
    }
}

fn header_str(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Job registered but not yet owned by a pipeline supervisor.
///
/// If the request is dropped first (client gone while queued) the job is
/// finished as failed so subscribers are not left hanging.
struct PendingJob {
    jobs: JobRegistry,
    job_id: Option<String>,
}

impl PendingJob {
    fn register(jobs: &JobRegistry, job_id: Option<&str>, duration: Option<f64>) -> Self {
        if let Some(id) = job_id {
            jobs.begin(id, duration);
        }
        Self {
            jobs: jobs.clone(),
            job_id: job_id.map(str::to_string),
        }
    }

    fn fail(&mut self, error: &AppError) {
        if let Some(id) = self.job_id.take() {
            self.jobs.mark_done(&id, Err(error.to_string()));
        }
    }

    fn hand_off(mut self) -> Option<String> {
        self.job_id.take()
    }
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        if let Some(id) = self.job_id.take() {
            self.jobs.mark_done(&id, Err("cancelled before start".to_string()));
        }
    }
}
