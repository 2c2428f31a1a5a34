//! Transcode pipeline: sources, presets, progress, jobs, admission, probe.

pub mod admission;
pub mod jobs;
pub mod pipeline;
pub mod presets;
pub mod probe;
pub mod progress;
pub mod service;
pub mod source;
pub mod ytdlp_errors;

// Re-exports for convenience
pub use admission::AdmissionController;
pub use jobs::{JobEvent, JobRegistry};
pub use pipeline::{PipelineState, TranscodeOrchestrator};
pub use presets::{OutputTarget, TranscodeRequest};
pub use probe::{CommandProbe, MediaInfo, MetadataProbe};
pub use service::{DownloadService, MediaDownload};
pub use source::SourceResolver;
