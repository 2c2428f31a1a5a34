//! Logging initialization and start-up diagnostics
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - A configuration summary logged once at start-up

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config::AppConfig;

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to initialize logger
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs the effective configuration at application startup
///
/// Reports subprocess binaries, size ceilings, admission limit, allow-list and
/// whether the yt-dlp cookies file actually exists.
pub fn log_startup_configuration(config: &AppConfig) {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("mediaforge configuration");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("  ffmpeg:  {}", config.ffmpeg_bin);
    log::info!("  ffprobe: {}", config.ffprobe_bin);
    log::info!("  yt-dlp:  {}", config.ytdl_bin);
    log::info!(
        "  limits:  image {} MB, video {} MB, {} concurrent transcode(s)",
        config.max_image_bytes / crate::core::config::size::BYTES_PER_MB,
        config.max_video_bytes / crate::core::config::size::BYTES_PER_MB,
        config.max_concurrent_transcodes
    );

    if config.allowed_hosts.is_empty() {
        log::info!("  hosts:   any (ALLOWED_HOSTS not set)");
    } else {
        log::info!("  hosts:   {}", config.allowed_hosts.join(", "));
    }

    match &config.cookies_file {
        Some(path) if path.exists() => log::info!("  cookies: {}", path.display()),
        Some(path) => log::warn!("  cookies: {} (FILE NOT FOUND, yt-dlp will run without it)", path.display()),
        None => log::info!("  cookies: not configured"),
    }
}
