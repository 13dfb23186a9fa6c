//! Camvault Ingest Service
//!
//! Receives JPEG frames from remote cameras over HTTP, serves live view,
//! records continuously and extracts motion clips.
//!
//! # Architecture
//!
//! ```text
//! HTTP upload -> FrameExtractor -> Ingestor (per-device lock) -> ClipWorkerPool -> ffmpeg
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CAMVAULT_)
//!
//! See `config.rs` for detailed configuration options.

use camvault_ingest::config::{IngestConfig, LoggingConfig};
use camvault_ingest::motion::{FrameDiffDetector, FrameDiffSettings};
use camvault_ingest::video::FfmpegSink;
use camvault_ingest::{start_api_server, AppState, Ingestor, ShutdownReport};

use anyhow::Context;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "camvault-ingest",
        version = env!("CARGO_PKG_VERSION"),
        root_dir = %config.storage.root_dir.display(),
        "Starting camera ingest service"
    );

    // Validate configuration
    config.validate()?;

    let result = run(config).await;

    match result {
        Ok(()) => {
            info!("Ingest service completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Ingest service failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load and validate configuration.
fn load_config() -> anyhow::Result<IngestConfig> {
    // Try loading from files first, fall back to environment
    let config = IngestConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        IngestConfig::from_env()
    })?;

    Ok(config)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_level(&config.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("camvault_ingest={}", level).parse()?)
        .add_directive("tower_http=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.format == "json" {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer.pretty()).init();
    }

    Ok(())
}

/// Build the pipeline, serve until a shutdown signal, then flush and drain.
async fn run(config: IngestConfig) -> anyhow::Result<()> {
    let sink = Arc::new(FfmpegSink::new(config.storage.ffmpeg_path.clone()));
    let detectors = FrameDiffDetector::factory(FrameDiffSettings::from(&config.motion));
    let ingestor = Arc::new(Ingestor::new(&config, sink, detectors));

    let state = AppState::new(ingestor.clone(), &config.server)
        .context("Failed to encode placeholder frame")?;

    info!(
        fps = config.motion.fps,
        window_frames = config.motion.segment_frames(),
        buffer_frames = config.motion.buffer_frames(),
        min_recording_frames = config.motion.min_recording_frames(),
        rotation_minutes = config.recording.rotation_minutes,
        workers = config.workers.num_workers,
        "Pipeline configured"
    );

    let (stop_tx, stop_rx) = watch::channel(false);

    // Spawn the stale-device sweep
    let sweep_handle = tokio::spawn({
        let ingestor = ingestor.clone();
        let timeout = config.server.device_timeout();
        let stop_rx = stop_rx.clone();
        async move {
            run_device_sweep(ingestor, timeout, stop_rx).await;
        }
    });

    let shutdown = {
        let mut stop_rx = stop_rx;
        async move {
            let _ = stop_rx.changed().await;
        }
    };

    // Spawn the API server
    let server_config = config.server.clone();
    let server_handle = tokio::spawn(async move { start_api_server(state, &server_config, shutdown).await });

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    // Stop accepting connections, then flush what is buffered
    let _ = stop_tx.send(true);
    let report = ingestor.shutdown().await;

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server error"),
        Err(e) => error!(error = %e, "API server task failed"),
    }
    if let Err(e) = sweep_handle.await {
        warn!(error = %e, "Device sweep task failed");
    }

    log_final_stats(&report);

    info!("Shutdown complete");
    Ok(())
}

/// Periodically mark devices that stopped sending frames as offline.
async fn run_device_sweep(ingestor: Arc<Ingestor>, timeout: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(timeout.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ingestor.registry().mark_stale(Local::now(), timeout);
            }
            _ = stop_rx.changed() => break,
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(report: &ShutdownReport) {
    info!("=== Final Statistics ===");

    info!(
        frames_accepted = report.ingest.frames_accepted,
        frames_rejected = report.ingest.frames_rejected,
        clip_tasks = report.ingest.clip_tasks,
        final_tasks = report.final_tasks,
        "Ingest final stats"
    );

    info!(
        submitted = report.pool.submitted,
        completed = report.pool.completed,
        dropped = report.pool.dropped,
        "Clip worker final stats"
    );
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
