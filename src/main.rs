use anyhow::Result;
use dotenvy::dotenv;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use mediaforge::cli::{Cli, Commands, TargetArgs};
use mediaforge::core::web_server::{start_server, AppState};
use mediaforge::core::{config, init_logger, log_startup_configuration, AppConfig};
use mediaforge::download::pipeline::PipelineState;
use mediaforge::download::probe::{CommandProbe, MetadataProbe};
use mediaforge::download::progress::{ProgressCallback, ProgressEvent};
use mediaforge::download::source::http::build_client;
use mediaforge::download::{DownloadService, OutputTarget, SourceResolver, TranscodeOrchestrator, TranscodeRequest};

/// Main entry point
///
/// Parses CLI arguments and dispatches to the selected subcommand.
///
/// # Errors
/// Returns an error if initialization fails or the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Log panics from spawned tasks instead of losing them on stderr
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
        if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            log::error!("Panic message: {}", msg);
        }
    }));

    // .env must be loaded before any config static is touched
    let _ = dotenv();

    init_logger(&config::LOG_FILE_PATH)?;

    let mut app_config = AppConfig::from_env();

    match cli.command {
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                app_config.port = port;
            }
            run_server(app_config).await
        }
        Some(Commands::Probe { url, json }) => run_cli_probe(app_config, url, json).await,
        Some(Commands::Transcode { url, output, target }) => run_cli_transcode(app_config, url, output, target).await,
        None => {
            log::info!("No command specified, starting server");
            run_server(app_config).await
        }
    }
}

async fn run_server(app_config: AppConfig) -> Result<()> {
    log_startup_configuration(&app_config);
    let service = DownloadService::new(app_config)?;
    start_server(AppState::new(service)).await?;
    log::info!("Server stopped");
    Ok(())
}

/// Run CLI probe command
async fn run_cli_probe(app_config: AppConfig, url: String, json: bool) -> Result<()> {
    let url = mediaforge::core::validation::parse_media_url(&url)?;
    let info = CommandProbe::new(&app_config).probe(&url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Title:     {}", info.title.as_deref().unwrap_or("-"));
    println!(
        "Duration:  {}",
        info.duration_seconds()
            .map(|d| format!("{:.1}s", d))
            .unwrap_or_else(|| "unknown".into())
    );
    println!(
        "Bit rate:  {}",
        info.format
            .bit_rate
            .map(|b| format!("{} kbit/s", b / 1000))
            .unwrap_or_else(|| "unknown".into())
    );
    for stream in &info.streams {
        match (stream.width, stream.height) {
            (Some(w), Some(h)) => println!(
                "Stream:    {} {} {}x{}",
                stream.codec_type,
                stream.codec_name.as_deref().unwrap_or("?"),
                w,
                h
            ),
            _ => println!(
                "Stream:    {} {}",
                stream.codec_type,
                stream.codec_name.as_deref().unwrap_or("?")
            ),
        }
    }
    Ok(())
}

/// Run CLI transcode command: same pipeline as the server, written to a file.
async fn run_cli_transcode(app_config: AppConfig, url: String, output: PathBuf, target: TargetArgs) -> Result<()> {
    let url = mediaforge::core::validation::parse_media_url(&url)?;
    let target = if target.audio {
        OutputTarget::audio(target.codec.as_deref(), target.kbps.as_deref())?
    } else {
        OutputTarget::video(target.format.as_deref(), target.vcodec.as_deref(), target.quality.as_deref())?
    };
    let request = TranscodeRequest::new(url, target, None);

    println!("🎬 mediaforge transcode");
    println!("========================");
    println!("URL:    {}", request.url);
    println!("Target: {}", request.target.filename());
    println!("Output: {}", output.display());

    let duration = match CommandProbe::new(&app_config).probe(&request.url).await {
        Ok(info) => info.duration_seconds(),
        Err(e) => {
            log::warn!("Probe failed, progress percent unavailable: {}", e);
            None
        }
    };

    let on_progress = console_progress(duration);
    let resolver = SourceResolver::from_config(&app_config, build_client()?);
    let source = resolver.resolve(&request, Arc::clone(&on_progress)).await?;
    let pipeline = TranscodeOrchestrator::new(app_config.ffmpeg_bin.clone()).start(&request, source, on_progress)?;

    let mut file = tokio::fs::File::create(&output).await?;
    let mut stream = pipeline.stream;
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            Err(e) => {
                eprintln!("\n❌ Transcode failed: {}", e);
                drop(file);
                if let Err(remove_err) = tokio::fs::remove_file(&output).await {
                    log::warn!("Failed to remove partial output {}: {}", output.display(), remove_err);
                }
                return Err(e.into());
            }
        }
    }
    file.flush().await?;

    match pipeline.handle.wait().await {
        PipelineState::Done => {
            println!("\n✅ Done: {} bytes written to {}", written, output.display());
            Ok(())
        }
        other => Err(anyhow::anyhow!("Transcode ended in state {}", other)),
    }
}

/// Logs progress to the console: each download percent, each transcoded percent
/// (or every 10s of media when the duration is unknown).
fn console_progress(duration: Option<f64>) -> ProgressCallback {
    let last_logged = Mutex::new((None::<u8>, None::<u64>));
    Arc::new(move |event| {
        let mut last_logged = last_logged.lock();
        match event {
            ProgressEvent::DownloadingSource { percent: Some(p) } => {
                if last_logged.0 != Some(p) {
                    last_logged.0 = Some(p);
                    log::info!("Downloading source: {}%", p);
                }
            }
            ProgressEvent::Transcoding {
                position_seconds: Some(pos),
                speed_multiplier,
                ..
            } => {
                let bucket = match duration {
                    Some(total) => (pos / total * 100.0).min(100.0) as u64,
                    None => (pos / 10.0) as u64,
                };
                if last_logged.1 == Some(bucket) {
                    return;
                }
                last_logged.1 = Some(bucket);
                let speed = speed_multiplier.map(|s| format!("{}x", s)).unwrap_or_else(|| "?".into());
                match duration {
                    Some(total) => log::info!("Transcoding: {}% ({:.1}s / {:.1}s, {})", bucket, pos, total, speed),
                    None => log::info!("Transcoding: {:.1}s ({})", pos, speed),
                }
            }
            _ => {}
        }
    })
}
