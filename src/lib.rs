//! mediaforge - streaming media download and transcode service
//!
//! Resolves a media URL to a byte stream (direct HTTP fetch or a yt-dlp
//! subprocess), pipes it through ffmpeg and streams the result back while
//! publishing live progress to any number of SSE subscribers.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, metrics, validation, HTTP server
//! - `download`: sources, presets, progress parsing, pipeline, jobs, admission, probe

pub mod cli;
pub mod core;
pub mod download;

// Re-export commonly used types for convenience
pub use core::{config, AppConfig, AppError, AppResult};
pub use download::{DownloadService, JobRegistry, TranscodeOrchestrator};
