//! Process execution utilities with timeout support
//!
//! Provides helpers for running external processes (ffmpeg, ffprobe, yt-dlp)
//! with configurable timeouts to prevent hung processes from blocking the pipeline,
//! plus a bounded diagnostic tail used in error messages.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

use crate::core::error::AppError;

/// Run an async Command to completion with a timeout.
///
/// stdout and stderr are captured; stdin is closed. The child is spawned with
/// `kill_on_drop`, so a timeout kills it. A spawn failure is reported as
/// `AppError::Spawn` naming the program.
pub async fn run_with_timeout(cmd: &mut Command, program: &str, timeout: Duration) -> Result<Output, AppError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| AppError::Spawn {
        program: program.to_string(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => {
            log::error!("{} timed out after {}s, killing", program, timeout.as_secs());
            Err(AppError::Timeout(program.to_string(), timeout.as_secs()))
        }
    }
}

/// Keeps the last `capacity` bytes of a subprocess diagnostic stream.
#[derive(Debug)]
pub struct DiagnosticTail {
    buf: Vec<u8>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Last non-empty line, or the whole tail when it has no line breaks.
    pub fn summary(&self) -> String {
        let text = String::from_utf8_lossy(&self.buf);
        text.split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or_default()
            .to_string()
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_tail_keeps_last_bytes() {
        let mut tail = DiagnosticTail::new(8);
        tail.push(b"abcdef");
        tail.push(b"ghijkl");
        assert_eq!(tail.into_string(), "efghijkl");
    }

    #[test]
    fn test_diagnostic_tail_large_chunk() {
        let mut tail = DiagnosticTail::new(4);
        tail.push(b"0123456789");
        assert_eq!(tail.into_string(), "6789");
    }

    #[test]
    fn test_diagnostic_tail_summary_picks_last_line() {
        let mut tail = DiagnosticTail::new(256);
        tail.push(b"frame=1 time=00:00:01.00\rpipe:0: Invalid data found when processing input\n");
        assert_eq!(tail.summary(), "pipe:0: Invalid data found when processing input");
    }

    #[tokio::test]
    async fn test_run_with_timeout_missing_binary() {
        let mut cmd = Command::new("definitely-not-a-real-binary-mediaforge");
        let err = run_with_timeout(&mut cmd, "definitely-not-a-real-binary-mediaforge", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo '{\"ok\":1}'; echo 'Server returned 404 Not Found' >&2; exit 3"]);
        let output = run_with_timeout(&mut cmd, "sh", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "{\"ok\":1}");
        assert_eq!(
            String::from_utf8_lossy(&output.stderr).trim(),
            "Server returned 404 Not Found"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_timeout_kills_slow_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout(&mut cmd, "sleep", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_, _)));
    }
}
