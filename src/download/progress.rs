//! Progress telemetry extraction from subprocess diagnostic output.
//!
//! `parse` is a pure function over a chunk of text: it recognizes the
//! downloader's `[download]  42.5%` lines and the transcoder's
//! `time=00:01:05.20 fps=30 speed=1.1x bitrate=...` lines and turns them into
//! typed [`ProgressEvent`]s. `drain_diagnostics` is the async side: it reads a
//! diagnostic pipe to EOF, feeding complete lines through `parse` and keeping
//! only a bounded tail for error reporting.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::config;
use crate::core::process::DiagnosticTail;

#[allow(clippy::expect_used)]
static DOWNLOAD_PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s*([^\s%]+)%").expect("download percent regex"));

#[allow(clippy::expect_used)]
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"time=\s*(\S+)").expect("time regex"));

#[allow(clippy::expect_used)]
static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):(\d{2}):(\d{2}(?:\.\d+)?)$").expect("clock regex"));

#[allow(clippy::expect_used)]
static FPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"fps=\s*([\d.]+)").expect("fps regex"));

#[allow(clippy::expect_used)]
static SPEED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("speed regex"));

#[allow(clippy::expect_used)]
static BITRATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bitrate=\s*([\d.]+\s*\w?bits/s)").expect("bitrate regex"));

/// Longest partial line carried between reads before it is discarded.
const MAX_CARRY_BYTES: usize = 1024;

/// Coarse stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Queued,
    DownloadingSource,
    Transcoding,
}

/// One telemetry sample. The fields present depend on the phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    /// Waiting for an admission slot
    Queued,
    /// External downloader is fetching the source; percent is its own report
    DownloadingSource { percent: Option<u8> },
    /// Transcoder is running; position is elapsed media time
    Transcoding {
        position_seconds: Option<f64>,
        fps: Option<f64>,
        speed_multiplier: Option<f64>,
        bitrate: Option<String>,
    },
}

impl ProgressEvent {
    pub fn phase(&self) -> Phase {
        match self {
            ProgressEvent::Queued => Phase::Queued,
            ProgressEvent::DownloadingSource { .. } => Phase::DownloadingSource,
            ProgressEvent::Transcoding { .. } => Phase::Transcoding,
        }
    }

    pub fn position_seconds(&self) -> Option<f64> {
        match self {
            ProgressEvent::Transcoding { position_seconds, .. } => *position_seconds,
            _ => None,
        }
    }
}

/// Sink for progress events. Must not block; it runs on the drain task.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A callback that discards everything.
pub fn ignore_progress() -> ProgressCallback {
    Arc::new(|_| {})
}

/// Extracts zero or more events from a chunk of diagnostic text.
///
/// The phase selects which line shape is recognized: bracketed percentages
/// for the downloader, `time=` lines for the transcoder. Lines that don't
/// match produce nothing.
///
/// # Examples
/// ```
/// use mediaforge::download::progress::{parse, Phase, ProgressEvent};
///
/// let events = parse(Phase::DownloadingSource, "[download]  42.5%");
/// assert_eq!(events, vec![ProgressEvent::DownloadingSource { percent: Some(42) }]);
/// assert!(parse(Phase::Transcoding, "Press [q] to stop").is_empty());
/// ```
pub fn parse(phase: Phase, chunk: &str) -> Vec<ProgressEvent> {
    chunk
        .split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match phase {
            Phase::DownloadingSource => parse_download_line(line),
            Phase::Transcoding => parse_transcode_line(line),
            Phase::Queued => None,
        })
        .collect()
}

fn parse_download_line(line: &str) -> Option<ProgressEvent> {
    let caps = DOWNLOAD_PERCENT_RE.captures(line)?;
    let percent = caps[1]
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        // truncate, never round up to a premature 100
        .map(|p| p.clamp(0.0, 100.0) as u8);
    Some(ProgressEvent::DownloadingSource { percent })
}

fn parse_transcode_line(line: &str) -> Option<ProgressEvent> {
    let caps = TIME_RE.captures(line)?;
    Some(ProgressEvent::Transcoding {
        position_seconds: parse_clock(&caps[1]),
        fps: capture_f64(&FPS_RE, line),
        speed_multiplier: capture_f64(&SPEED_RE, line),
        bitrate: BITRATE_RE
            .captures(line)
            .map(|c| c[1].split_whitespace().collect::<String>()),
    })
}

/// `HH:MM:SS.ss` → seconds. `N/A` and other garbage yield `None`.
fn parse_clock(raw: &str) -> Option<f64> {
    let caps = CLOCK_RE.captures(raw)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    // ffmpeg prints 65.20 as 00:01:05.20; keep two decimals stable
    Some((total * 100.0).round() / 100.0)
}

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)?[1].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Reads a diagnostic pipe to EOF.
///
/// Complete lines go through `parse(phase, ..)` and every event is handed to
/// `on_event`. Only the last `DIAGNOSTIC_TAIL_BYTES` of raw output are kept,
/// so a chatty subprocess never accumulates memory or stalls on a full pipe.
pub async fn drain_diagnostics<R>(mut reader: R, phase: Phase, on_event: ProgressCallback) -> DiagnosticTail
where
    R: AsyncRead + Unpin,
{
    let mut tail = DiagnosticTail::new(config::transcode::DIAGNOSTIC_TAIL_BYTES);
    let mut buf = vec![0u8; 4096];
    let mut carry = String::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Diagnostic stream ({}) read error: {}", phase, e);
                break;
            }
        };
        tail.push(&buf[..n]);

        carry.push_str(&String::from_utf8_lossy(&buf[..n]));
        let Some(cut) = carry.rfind(|c| c == '\r' || c == '\n') else {
            if carry.len() > MAX_CARRY_BYTES {
                carry.clear();
            }
            continue;
        };

        let complete: String = carry.drain(..=cut).collect();
        log::trace!("[{}] {}", phase, complete.trim_end());
        for event in parse(phase, &complete) {
            on_event(event);
        }
    }

    if !carry.is_empty() {
        for event in parse(phase, &carry) {
            on_event(event);
        }
    }
    tail
}
