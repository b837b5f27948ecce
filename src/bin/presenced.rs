//! presenced - person presence daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by `--config`/`PRESENCE_CONFIG`, then env)
//! 2. Opens the event store and the live broadcaster
//! 3. Starts the detector service on the configured camera source
//! 4. Prints every presence event to stdout as one JSON line
//! 5. Stops the detection loop cleanly on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use presence_kernel::config::validate_camera_id;
use presence_kernel::{
    BrightBlobDetector, Broadcaster, ChannelSink, DetectorRegistry, DetectorService,
    PresenceConfig, SqliteEventStore, StoreAndBroadcast,
};

const STDOUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Detect person presence on a camera source and publish presence events"
)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured camera id.
    #[arg(long)]
    camera_id: Option<String>,

    /// Override the configured source descriptor (`0`, `stub://name`, `http://...`).
    #[arg(long)]
    source: Option<String>,

    /// Adapter used when the configured model has no adapter of its own.
    #[arg(long, env = "PRESENCE_DETECTOR", default_value = "bright-blob")]
    detector: String,

    /// Do not print events to stdout.
    #[arg(long)]
    quiet_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PresenceConfig::load_from(args.config.as_deref())?;
    if let Some(camera_id) = &args.camera_id {
        cfg.camera_id = validate_camera_id(camera_id)?;
    }
    if let Some(source) = args.source {
        cfg.service.camera.source = source;
        cfg.service.validate()?;
    }

    let store = Arc::new(
        SqliteEventStore::open(&cfg.paths.db_path)
            .with_context(|| format!("open event store {}", cfg.paths.db_path))?,
    );
    let broadcaster = Arc::new(Broadcaster::new());

    let printer = if args.quiet_events {
        None
    } else {
        let (sink, mut rx) = ChannelSink::pair(STDOUT_CHANNEL_CAPACITY);
        broadcaster.connect(Box::new(sink)).await?;
        Some(tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                println!("{}", line);
            }
        }))
    };

    let mut registry = DetectorRegistry::new();
    registry.register("bright-blob", |_| Ok(BrightBlobDetector::default()));
    registry.set_default(&args.detector).with_context(|| {
        format!(
            "--detector {} (available: {})",
            args.detector,
            registry.list().join(", ")
        )
    })?;
    log::info!(
        "detectors: {} (fallback {})",
        registry.list().join(", "),
        args.detector
    );

    let emitter = Arc::new(StoreAndBroadcast::new(store, broadcaster.clone()));
    let service = DetectorService::new(
        cfg.camera_id.clone(),
        cfg.service.clone(),
        Arc::new(registry),
        emitter,
    )
    .with_tracker(cfg.tracker)
    .with_static_mount(cfg.paths.static_mount.clone())
    .with_snapshot_dir(cfg.paths.snapshot_dir.clone());

    service.start().await?;
    log::info!(
        "presenced running: camera {} on {}, events in {}",
        cfg.camera_id,
        cfg.service.camera.source,
        cfg.paths.db_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl-C handler")?;
    log::info!("shutdown requested");
    service.stop().await?;

    drop(service);
    drop(broadcaster);
    if let Some(printer) = printer {
        // Ends once the last sender (held by the broadcaster) is gone.
        let _ = printer.await;
    }
    Ok(())
}
