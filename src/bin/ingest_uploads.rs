//! ingest_uploads - run person detection on uploaded JPEG snapshots
//!
//! Each image is detected once (no dedup). Images with a person become
//! presence events that are persisted and printed to stdout as JSON lines.
//! Images are expected to live in the served snapshot directory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use presence_kernel::config::validate_camera_id;
use presence_kernel::{
    BrightBlobDetector, Broadcaster, ChannelSink, DetectorProvider, DetectorRegistry,
    PresenceConfig, SqliteEventStore, StillImage, StillImageDetector, StillImageQueue,
    StoreAndBroadcast,
};

const QUEUE_CAPACITY: usize = 16;

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect people on uploaded JPEG snapshots")]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Camera the images were uploaded by (defaults to the configured camera id).
    #[arg(long)]
    camera_id: Option<String>,

    /// Adapter used when the configured model has no adapter of its own.
    #[arg(long, env = "PRESENCE_DETECTOR", default_value = "bright-blob")]
    detector: String,

    /// JPEG files to process, in order.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = PresenceConfig::load_from(args.config.as_deref())?;
    let camera_id = match &args.camera_id {
        Some(id) => validate_camera_id(id)?,
        None => cfg.camera_id.clone(),
    };

    let mut registry = DetectorRegistry::new();
    registry.register("bright-blob", |_| Ok(BrightBlobDetector::default()));
    registry.set_default(&args.detector)?;
    let adapter = registry
        .load(&cfg.service.model)
        .with_context(|| format!("load model {}", cfg.service.model.model))?;

    let snapshot_dir_name = cfg
        .paths
        .snapshot_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshots");
    let detector = StillImageDetector::new(adapter, cfg.service.inference_params())
        .with_snapshot_mount(format!(
            "{}/{}",
            cfg.paths.static_mount.trim_end_matches('/'),
            snapshot_dir_name
        ));

    let store = Arc::new(
        SqliteEventStore::open(&cfg.paths.db_path)
            .with_context(|| format!("open event store {}", cfg.paths.db_path))?,
    );
    let broadcaster = Arc::new(Broadcaster::new());
    let (sink, mut rx) = ChannelSink::pair(QUEUE_CAPACITY);
    broadcaster.connect(Box::new(sink)).await?;
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line);
        }
    });

    let emitter = Arc::new(StoreAndBroadcast::new(store, broadcaster.clone()));
    let (queue, worker) = StillImageQueue::spawn(detector, emitter, QUEUE_CAPACITY);
    let submitted = args.images.len();
    for path in args.images {
        queue.submit(StillImage::new(path, camera_id.as_str())).await?;
    }
    drop(queue);

    let emitted = worker.await.context("upload worker")?;
    log::info!("{} of {} uploads contained a person", emitted, submitted);

    drop(broadcaster);
    let _ = printer.await;
    Ok(())
}
