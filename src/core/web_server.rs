//! HTTP surface: download endpoints, progress SSE, health and metrics.
//!
//! Handlers stay thin. Validation and pipeline work live in
//! `DownloadService`; errors before the first byte render as JSON through
//! `AppError`'s `IntoResponse`, later failures abort the chunked body.

use axum::{
    body::Body,
    extract::{Query, State},
    handler::HandlerWithoutStateExt,
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::core::config;
use crate::core::error::AppError;
use crate::core::metrics;
use crate::download::jobs::{JobEvent, JobSubscription};
use crate::download::presets::{OutputTarget, TranscodeRequest};
use crate::download::service::{DownloadService, MediaDownload};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: DownloadService,
    start_time: Instant,
}

impl AppState {
    pub fn new(service: DownloadService) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoQuery {
    url: Option<String>,
    quality: Option<String>,
    format: Option<String>,
    vcodec: Option<String>,
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioQuery {
    url: Option<String>,
    kbps: Option<String>,
    codec: Option<String>,
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressQuery {
    job_id: Option<String>,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/probe", get(probe_handler))
        .route("/api/image", get(image_handler))
        .route("/api/video", get(video_handler))
        .route("/api/audio", get(audio_handler))
        .route("/api/progress", get(progress_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let static_dir = state.service.config().static_dir.clone();
    let app = if static_dir.is_dir() {
        log::info!("Serving static files from {}", static_dir.display());
        api.fallback_service(ServeDir::new(static_dir).not_found_service(not_found_handler.into_service()))
    } else {
        api.fallback(not_found_handler)
    };

    app.layer(CorsLayer::permissive()).with_state(state)
}

/// Binds and serves until Ctrl-C.
pub async fn start_server(state: AppState) -> std::io::Result<()> {
    let config = state.service.config();
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let app = router(state);

    log::info!("Starting HTTP server on http://{}", addr);
    log::info!("  /api/probe     - Media metadata (JSON)");
    log::info!("  /api/image     - Image passthrough");
    log::info!("  /api/video     - Video transcode");
    log::info!("  /api/audio     - Audio extraction");
    log::info!("  /api/progress  - Progress events (SSE)");
    log::info!("  /health        - Health check");
    log::info!("  /metrics       - Prometheus metrics");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

/// GET /api/probe
async fn probe_handler(State(state): State<AppState>, Query(q): Query<UrlQuery>) -> Response {
    match state.service.probe(q.url.as_deref()).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/image
async fn image_handler(State(state): State<AppState>, Query(q): Query<UrlQuery>) -> Response {
    match state.service.image(q.url.as_deref()).await {
        Ok(download) => download_response(download),
        Err(e) => e.into_response(),
    }
}

/// GET /api/video
async fn video_handler(State(state): State<AppState>, Query(q): Query<VideoQuery>) -> Response {
    let request = state.service.validate_url(q.url.as_deref()).and_then(|url| {
        let target = OutputTarget::video(q.format.as_deref(), q.vcodec.as_deref(), q.quality.as_deref())?;
        Ok(TranscodeRequest::new(url, target, q.job_id))
    });
    transcode(&state, request).await
}

/// GET /api/audio
async fn audio_handler(State(state): State<AppState>, Query(q): Query<AudioQuery>) -> Response {
    let request = state.service.validate_url(q.url.as_deref()).and_then(|url| {
        let target = OutputTarget::audio(q.codec.as_deref(), q.kbps.as_deref())?;
        Ok(TranscodeRequest::new(url, target, q.job_id))
    });
    transcode(&state, request).await
}

async fn transcode(state: &AppState, request: Result<TranscodeRequest, AppError>) -> Response {
    let request = match request {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    match state.service.transcode(request).await {
        Ok(download) => download_response(download),
        Err(e) => e.into_response(),
    }
}

fn download_response(download: MediaDownload) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    (
        [(CONTENT_TYPE, download.content_type), (CONTENT_DISPOSITION, disposition)],
        Body::from_stream(download.stream),
    )
        .into_response()
}

/// GET /api/progress: server-sent events for one job.
///
/// Events: `snapshot` first, then `update`s, then one `done` after which the
/// stream closes.
async fn progress_handler(State(state): State<AppState>, Query(q): Query<ProgressQuery>) -> Response {
    let Some(job_id) = q.job_id.filter(|id| !id.trim().is_empty()) else {
        return AppError::MissingParameter("jobId").into_response();
    };
    let subscription = state.service.jobs().subscribe(&job_id);
    Sse::new(progress_events(subscription))
        .keep_alive(KeepAlive::new().interval(config::progress::keep_alive()))
        .into_response()
}

fn progress_events(subscription: JobSubscription) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(Some(subscription), |subscription| async move {
        let mut subscription = subscription?;
        let event = subscription.recv().await?;
        let sse = Event::default().event(event.event_name()).json_data(event.to_json());
        let next = match event {
            JobEvent::Done { .. } => None,
            _ => Some(subscription),
        };
        Some((sse, next))
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let admission = state.service.admission();
    let body = json!({
        "status": "healthy",
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "activeTranscodes": admission.in_flight(),
        "queuedTranscodes": admission.waiting(),
        "maxConcurrentTranscodes": admission.limit(),
        "trackedJobs": state.service.jobs().len(),
    });
    (StatusCode::OK, Json(body))
}

/// GET /metrics
async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok((content_type, body)) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            log::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {}", e)).into_response()
        }
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = AppConfig {
            static_dir: "/nonexistent/mediaforge-static".into(),
            ..AppConfig::default()
        };
        router(AppState::new(DownloadService::new(config).unwrap()))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let response = app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await, json!({ "error": "Not found" }));
    }

    #[tokio::test]
    async fn test_progress_requires_job_id() {
        let response = app()
            .oneshot(Request::get("/api/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "jobId required" }));
    }

    #[tokio::test]
    async fn test_unsupported_pair_is_400() {
        let response = app()
            .oneshot(
                Request::get("/api/video?url=https://cdn.example.com/a.mp4&format=mp4&vcodec=vp9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_admission() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["activeTranscodes"], 0);
        assert_eq!(body["maxConcurrentTranscodes"], 4);
    }
}
