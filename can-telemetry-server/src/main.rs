//! CAN Telemetry Server
//!
//! Runs the telemetry pipeline as a process: loads the signal catalog, wires
//! a frame source into the normalizer, and exposes decoded messages to
//! WebSocket subscribers. Configuration comes from a TOML file with CLI
//! overrides for the common knobs.

use anyhow::{Context, Result};
use can_telemetry::catalog::Catalog;
use can_telemetry::pipeline::TelemetryPipeline;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

mod config;
mod source;
mod ws;

use config::ServerConfig;
use source::FrameSource;

/// CAN Telemetry Server - decode, aggregate and distribute CAN signals
#[derive(Parser, Debug)]
#[command(name = "can-telemetry-server")]
#[command(about = "Decode CAN frames and serve live telemetry over WebSocket", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the signal catalog JSON (overrides the config file)
    #[arg(long, value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// WebSocket bind address (overrides the config file)
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry Server v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using telemetry library v{}", can_telemetry::VERSION);

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    // A missing or empty catalog is fatal; nothing downstream can run
    let catalog_path = args
        .catalog
        .clone()
        .or_else(|| config.catalog.clone())
        .context("no signal catalog given; use --catalog or set 'catalog' in the config file")?;
    let catalog = Arc::new(
        Catalog::from_file(&catalog_path)
            .with_context(|| format!("failed to load catalog {:?}", catalog_path))?,
    );
    let stats = catalog.stats();
    log::info!(
        "Catalog loaded: {} messages, {} signals",
        stats.num_messages,
        stats.num_signals
    );

    let pipeline = Arc::new(TelemetryPipeline::new(
        catalog.clone(),
        config.pipeline.pipeline_config(),
    ));
    pipeline.start();

    // Frame source feeds the pipeline through a bounded channel; frames and
    // faults both count toward the source health dimension
    let (frame_tx, frame_rx) = mpsc::channel(config.source.frame_queue);
    let mut frame_source = FrameSource::new(config.source.kind()?, catalog);
    frame_source.start(frame_tx);

    let ingest_task = tokio::spawn(source::pump(
        frame_rx,
        pipeline.clone(),
        pipeline.cancellation_token(),
    ));

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let ws_task = {
        let hub = pipeline.hub();
        let queue = config.pipeline.client_queue;
        let cancel = pipeline.cancellation_token();
        let bind = bind.clone();
        tokio::spawn(async move { ws::run(&bind, hub, queue, cancel).await })
    };
    log::info!("Serving telemetry on ws://{}", bind);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("Shutdown signal received");

    // Ordering: stop the source, then timers + final flush, then the bridges
    frame_source.stop().await;
    pipeline.shutdown().await?;
    let _ = ingest_task.await;
    if let Ok(Err(e)) = ws_task.await {
        log::warn!("WebSocket listener ended with error: {}", e);
    }

    let (frames, errors) = frame_source.stats();
    log::info!("Source emitted {} frames ({} errors)", frames, errors);
    let snapshot = pipeline.health_snapshot().await;
    log::info!(
        "Final health: {:?}, {} stale signals",
        snapshot.report.overall,
        snapshot.stale_signals.len()
    );

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
