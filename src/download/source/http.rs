//! HttpSource: direct HTTP fetch streamed straight into the pipeline.
//!
//! The response body is never buffered: `bytes_stream()` is adapted into an
//! `AsyncRead` with `tokio_util::io::StreamReader`. An upstream status of 400
//! or above is an error, never an empty body.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Client;
use url::Url;

use crate::core::config;
use crate::core::error::AppError;
use crate::download::presets::TranscodeRequest;
use crate::download::progress::ProgressCallback;
use crate::download::source::{InputSource, ResolvedSource};

/// Source for plain http(s) media URLs.
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Shared HTTP client for upstream fetches and HEAD checks.
pub fn build_client() -> Result<Client, AppError> {
    Client::builder()
        .user_agent(config::network::USER_AGENT)
        .connect_timeout(config::network::connect_timeout())
        .build()
        .map_err(AppError::Http)
}

#[async_trait]
impl InputSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn supports_url(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn open(&self, request: &TranscodeRequest, _on_progress: ProgressCallback) -> Result<ResolvedSource, AppError> {
        let response = self
            .client
            .get(request.url.clone())
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to fetch source: {}", e)))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(AppError::Upstream(format!("Upstream returned {}", status.as_u16())));
        }

        log::debug!(
            "Fetching {} ({} bytes advertised)",
            request.url,
            response
                .content_length()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".into())
        );

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let reader = tokio_util::io::StreamReader::new(body);
        Ok(ResolvedSource::direct("http", Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::presets::OutputTarget;
    use crate::download::progress::ignore_progress;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: &str) -> TranscodeRequest {
        TranscodeRequest::new(
            Url::parse(url).unwrap(),
            OutputTarget::audio(None, None).unwrap(),
            None,
        )
    }

    #[tokio::test]
    async fn test_open_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw-media".to_vec()))
            .mount(&server)
            .await;

        let source = HttpSource::new(build_client().unwrap());
        let resolved = source
            .open(&request(&format!("{}/clip.mp4", server.uri())), ignore_progress())
            .await
            .unwrap();
        let (mut reader, completion) = resolved.into_parts();

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"raw-media");
        completion.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_upstream_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpSource::new(build_client().unwrap());
        let result = source
            .open(&request(&format!("{}/missing.mp4", server.uri())), ignore_progress())
            .await;
        match result {
            Err(AppError::Upstream(msg)) => assert!(msg.contains("404")),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("expected an upstream error"),
        }
    }

    #[test]
    fn test_supports_http_only() {
        let source = HttpSource::new(Client::new());
        assert!(source.supports_url(&Url::parse("https://cdn.example.com/a.mp4").unwrap()));
        assert!(!source.supports_url(&Url::parse("file:///etc/passwd").unwrap()));
    }
}
