//! Metrics collection using Prometheus
//!
//! This module provides a centralized metrics registry for tracking:
//! - Pipeline metrics (active transcodes, admission queue, outcomes, duration)
//! - Progress metrics (tracked jobs, connected subscribers)
//! - Probe metrics (attempts by outcome, retries)
//!
//! Registration happens once on first access; a duplicate name is a programming
//! error caught by the first test run, hence the `expect` calls below.

#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder, HistogramVec, IntGauge,
    TextEncoder,
};

// ======================
// PIPELINE METRICS
// ======================

lazy_static! {
    /// Transcoder pipelines currently holding an admission slot
    pub static ref TRANSCODES_ACTIVE: IntGauge = register_int_gauge!(
        "mediaforge_transcodes_active",
        "Transcodes currently holding an admission slot"
    )
    .expect("register mediaforge_transcodes_active");

    /// Requests waiting for an admission slot
    pub static ref ADMISSION_QUEUED: IntGauge = register_int_gauge!(
        "mediaforge_admission_queued",
        "Requests waiting for an admission slot"
    )
    .expect("register mediaforge_admission_queued");

    /// Finished transcodes
    /// Labels: kind (video/audio), outcome (done/failed)
    pub static ref TRANSCODES_TOTAL: CounterVec = register_counter_vec!(
        "mediaforge_transcodes_total",
        "Finished transcodes by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("register mediaforge_transcodes_total");

    /// Wall-clock duration of a transcode pipeline
    /// Labels: kind
    pub static ref TRANSCODE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "mediaforge_transcode_duration_seconds",
        "Time from transcoder spawn to pipeline teardown",
        &["kind"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    )
    .expect("register mediaforge_transcode_duration_seconds");
}

// ======================
// PROGRESS METRICS
// ======================

lazy_static! {
    /// Jobs currently held by the registry
    pub static ref JOBS_TRACKED: IntGauge = register_int_gauge!(
        "mediaforge_jobs_tracked",
        "Jobs currently held by the progress registry"
    )
    .expect("register mediaforge_jobs_tracked");

    /// Connected progress subscribers
    pub static ref PROGRESS_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "mediaforge_progress_subscribers",
        "Connected progress subscribers"
    )
    .expect("register mediaforge_progress_subscribers");
}

// ======================
// PROBE METRICS
// ======================

lazy_static! {
    /// Metadata probes
    /// Labels: backend (ffprobe/yt-dlp), outcome (ok/unavailable/error)
    pub static ref PROBES_TOTAL: CounterVec = register_counter_vec!(
        "mediaforge_probes_total",
        "Metadata probes by backend and outcome",
        &["backend", "outcome"]
    )
    .expect("register mediaforge_probes_total");

    /// Retries performed by the retry helper
    /// Labels: attempt
    pub static ref RETRY_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "mediaforge_retry_attempts_total",
        "Retries performed, labelled by the attempt that failed",
        &["attempt"]
    )
    .expect("register mediaforge_retry_attempts_total");
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<(String, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((
        encoder.format_type().to_string(),
        String::from_utf8_lossy(&buffer).into_owned(),
    ))
}
