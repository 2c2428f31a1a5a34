//! Transcode pipeline orchestrator.
//!
//! One call to [`TranscodeOrchestrator::start`] owns one ffmpeg child and the
//! resolved input source. Three tasks cooperate:
//!
//! - the feed task copies the source into ffmpeg's stdin, closes stdin once the
//!   source is drained, then waits for the source to finish (downloader exit);
//! - the diagnostics task parses ffmpeg's stderr into transcoding progress;
//! - the driver reads ffmpeg's stdout into the output channel and walks the
//!   pipeline state machine:
//!
//! ```text
//! Idle -> SourceActive -> Transcoding -> Done
//!              |               |
//!              +---------------+------> Failed
//! ```
//!
//! Teardown (kill remaining children, close remaining pipes) always happens on
//! entering a terminal state. The output stream only completes cleanly after
//! ffmpeg exits 0 and the source finished successfully; any other ending
//! yields a final `Err` item so the response body is aborted, never presented
//! as a complete file.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::core::config;
use crate::core::error::AppError;
use crate::core::metrics;
use crate::core::process::DiagnosticTail;
use crate::download::presets::TranscodeRequest;
use crate::download::progress::{drain_diagnostics, Phase, ProgressCallback};
use crate::download::source::{ResolvedSource, SourceCompletion, SourceReader};

/// Transcoded bytes. A trailing `Err` means the output is incomplete.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;

/// Lifecycle of one orchestrated pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing spawned yet
    Idle,
    /// Source bytes are being fed to the transcoder
    SourceActive,
    /// Source drained; transcoder is flushing
    Transcoding,
    /// Transcoder exited 0 and the source finished cleanly
    Done,
    /// Any other ending, with the reason
    Failed(String),
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::SourceActive => write!(f, "SourceActive"),
            PipelineState::Transcoding => write!(f, "Transcoding"),
            PipelineState::Done => write!(f, "Done"),
            PipelineState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

/// Observer for a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    state: watch::Receiver<PipelineState>,
}

impl PipelineHandle {
    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Resolves once the pipeline reaches `Done` or `Failed`.
    pub async fn wait(&self) -> PipelineState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(PipelineState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => PipelineState::Failed("pipeline task ended unexpectedly".to_string()),
        };
        state
    }
}

/// What `start` hands back: the bytes and a way to watch the lifecycle.
pub struct TranscodeOutput {
    pub stream: OutputStream,
    pub handle: PipelineHandle,
}

/// Spawns and supervises ffmpeg pipelines.
#[derive(Debug, Clone)]
pub struct TranscodeOrchestrator {
    ffmpeg_bin: String,
}

impl TranscodeOrchestrator {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    /// Starts transcoding `source` according to `request.target`.
    ///
    /// Fails synchronously on an unsupported container/codec pair (nothing is
    /// spawned) or when ffmpeg cannot be started. Every later failure is
    /// reported through the stream and the handle.
    pub fn start(
        &self,
        request: &TranscodeRequest,
        source: ResolvedSource,
        on_progress: ProgressCallback,
    ) -> Result<TranscodeOutput, AppError> {
        let args = request.target.ffmpeg_args()?;
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);

        log::debug!("Spawning {} {}", self.ffmpeg_bin, args.join(" "));
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AppError::Spawn {
                program: self.ffmpeg_bin.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(AppError::Spawn {
                program: self.ffmpeg_bin.clone(),
                source: std::io::Error::other("stdio not captured"),
            });
        };

        log::info!(
            "Transcode started: {} -> {} ({} source)",
            request.url,
            request.target.filename(),
            source.origin
        );

        let origin = source.origin;
        let (reader, completion) = source.into_parts();
        let feed = tokio::spawn(feed_input(reader, stdin, completion, origin));
        let diagnostics = tokio::spawn(drain_diagnostics(stderr, Phase::Transcoding, on_progress));

        let (tx, rx) = mpsc::channel(config::transcode::OUTPUT_CHANNEL_DEPTH);
        tokio::spawn(drive(Running {
            kind: request.target.kind(),
            program: self.ffmpeg_bin.clone(),
            child,
            stdout: Some(stdout),
            feed,
            diagnostics,
            tx,
            state: state_tx,
        }));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(TranscodeOutput {
            stream: Box::pin(stream),
            handle: PipelineHandle { state: state_rx },
        })
    }
}

/// Copies the source into ffmpeg's stdin.
///
/// A read error fails with `Upstream` after closing stdin, so ffmpeg can flush.
/// A write error means ffmpeg stopped reading; its exit status decides the outcome.
async fn feed_input(
    mut reader: SourceReader,
    mut stdin: ChildStdin,
    completion: SourceCompletion,
    origin: &'static str,
) -> Result<(), AppError> {
    let mut buf = vec![0u8; config::transcode::READ_CHUNK_BYTES];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(stdin);
                return Err(AppError::Upstream(format!("{} source failed: {}", origin, e)));
            }
        };
        if let Err(e) = stdin.write_all(&buf[..n]).await {
            log::debug!("Transcoder input closed after {} bytes: {}", total, e);
            return Ok(());
        }
        total += n as u64;
    }

    if let Err(e) = stdin.shutdown().await {
        log::debug!("Closing transcoder input: {}", e);
    }
    drop(stdin);
    drop(reader);
    log::debug!("{} source drained ({} bytes)", origin, total);

    completion.wait().await
}

struct Running {
    kind: &'static str,
    program: String,
    child: Child,
    stdout: Option<ChildStdout>,
    feed: JoinHandle<Result<(), AppError>>,
    diagnostics: JoinHandle<DiagnosticTail>,
    tx: mpsc::Sender<Result<Bytes, AppError>>,
    state: watch::Sender<PipelineState>,
}

/// Progress flags shared by the driver phases.
#[derive(Default)]
struct Flags {
    feed_done: bool,
    input_failed: bool,
}

fn flatten_join(joined: Result<Result<(), AppError>, JoinError>) -> Result<(), AppError> {
    joined.map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

fn deadline_error(program: &str) -> AppError {
    AppError::Timeout(program.to_string(), config::transcode::MAX_DURATION_SECS)
}

async fn drive(mut run: Running) {
    let started = Instant::now();
    let deadline = started + config::transcode::max_duration();
    let mut flags = Flags::default();

    run.state.send_replace(PipelineState::SourceActive);

    let result = match pump(&mut run, deadline, &mut flags).await {
        Ok(()) => finish(&mut run, deadline, &mut flags).await,
        Err(e) => Err(e),
    };

    teardown(&mut run, &flags).await;

    metrics::TRANSCODE_DURATION_SECONDS
        .with_label_values(&[run.kind])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            metrics::TRANSCODES_TOTAL.with_label_values(&[run.kind, "done"]).inc();
            log::info!("Transcode finished in {:.1}s", started.elapsed().as_secs_f64());
            run.state.send_replace(PipelineState::Done);
        }
        Err(AppError::ClientDisconnected) => {
            metrics::TRANSCODES_TOTAL
                .with_label_values(&[run.kind, "cancelled"])
                .inc();
            log::info!("Client went away; transcode torn down");
            run.state
                .send_replace(PipelineState::Failed(AppError::ClientDisconnected.to_string()));
        }
        Err(e) => {
            metrics::TRANSCODES_TOTAL.with_label_values(&[run.kind, "failed"]).inc();
            log::error!("Transcode failed ({}): {}", e.category(), e);
            run.state.send_replace(PipelineState::Failed(e.to_string()));
            // blocks until the client reads it or goes away
            let _ = run.tx.send(Err(e)).await;
        }
    }
}

/// Forwards ffmpeg stdout until EOF or the first failure.
async fn pump(run: &mut Running, deadline: Instant, flags: &mut Flags) -> Result<(), AppError> {
    let Some(stdout) = run.stdout.as_mut() else {
        return Ok(());
    };
    let mut buf = vec![0u8; config::transcode::READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            joined = &mut run.feed, if !flags.feed_done => {
                flags.feed_done = true;
                if let Err(e) = flatten_join(joined) {
                    flags.input_failed = true;
                    return Err(e);
                }
                run.state.send_replace(PipelineState::Transcoding);
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    match tokio::time::timeout_at(deadline, run.tx.send(Ok(chunk))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(AppError::ClientDisconnected),
                        Err(_) => return Err(deadline_error(&run.program)),
                    }
                }
                Err(e) => return Err(AppError::Io(e)),
            },
            _ = run.tx.closed() => return Err(AppError::ClientDisconnected),
            _ = tokio::time::sleep_until(deadline) => return Err(deadline_error(&run.program)),
        }
    }
}

/// After stdout EOF: the exit status decides, then the source's own outcome.
async fn finish(run: &mut Running, deadline: Instant, flags: &mut Flags) -> Result<(), AppError> {
    let status = match tokio::time::timeout_at(deadline, run.child.wait()).await {
        Ok(status) => status?,
        Err(_) => return Err(deadline_error(&run.program)),
    };

    // stderr hits EOF right after exit; let the last progress lines through
    let tail = match tokio::time::timeout(Duration::from_secs(2), &mut run.diagnostics).await {
        Ok(Ok(tail)) => tail,
        _ => DiagnosticTail::new(0),
    };
    if !status.success() {
        return Err(AppError::EncoderFailed {
            code: status.code(),
            detail: tail.summary(),
        });
    }

    if !flags.feed_done {
        let joined = tokio::time::timeout_at(deadline, &mut run.feed)
            .await
            .map_err(|_| deadline_error(&run.program))?;
        flags.feed_done = true;
        flatten_join(joined)?;
    }
    Ok(())
}

/// Terminal-state side effect: nothing of this pipeline survives it.
async fn teardown(run: &mut Running, flags: &Flags) {
    if !flags.feed_done {
        // drops the source, which kills a downloader child
        run.feed.abort();
    }

    if flags.input_failed {
        // stdin is already closed; give ffmpeg a moment to exit on its own
        run.stdout.take();
        if tokio::time::timeout(config::transcode::input_failure_grace(), run.child.wait())
            .await
            .is_err()
        {
            log::warn!("{} still running after input failure, killing", run.program);
        }
    }

    if matches!(run.child.try_wait(), Ok(None)) {
        if let Err(e) = run.child.start_kill() {
            log::debug!("Killing {}: {}", run.program, e);
        }
        let _ = run.child.wait().await;
    }
    run.stdout.take();
    run.diagnostics.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::presets::OutputTarget;
    use crate::download::progress::ignore_progress;
    use url::Url;

    fn request(target: OutputTarget) -> TranscodeRequest {
        TranscodeRequest::new(Url::parse("https://example.com/a.mp4").unwrap(), target, None)
    }

    fn empty_source() -> ResolvedSource {
        ResolvedSource::direct("test", Box::new(tokio::io::empty()))
    }

    #[tokio::test]
    async fn test_unsupported_pair_fails_before_spawn() {
        let orchestrator = TranscodeOrchestrator::new("definitely-not-ffmpeg-mediaforge");
        let target = OutputTarget::Video {
            container: crate::download::presets::Container::Mp4,
            codec: crate::download::presets::VideoCodec::Vp9,
            quality: Default::default(),
        };
        let result = orchestrator.start(&request(target), empty_source(), ignore_progress());
        assert!(matches!(result, Err(AppError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let orchestrator = TranscodeOrchestrator::new("definitely-not-ffmpeg-mediaforge");
        let target = OutputTarget::audio(None, None).unwrap();
        let result = orchestrator.start(&request(target), empty_source(), ignore_progress());
        assert!(matches!(result, Err(AppError::Spawn { .. })));
    }

    #[test]
    fn test_terminal_states() {
        assert!(PipelineState::Done.is_terminal());
        assert!(PipelineState::Failed("x".into()).is_terminal());
        assert!(!PipelineState::Transcoding.is_terminal());
        assert_eq!(PipelineState::Failed("boom".into()).to_string(), "Failed: boom");
    }
}
