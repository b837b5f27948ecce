//! Detector service lifecycle.
//!
//! `DetectorService` owns the current `ServiceConfig` and at most one running
//! detection loop. Control operations (`start`, `stop`, `restart`,
//! `switch_source`, `update_params`) are serialized behind one async lock, so
//! a restart always finishes stopping the old loop, including releasing its
//! frame source, before the new loop opens one. `status` never waits on that
//! lock; it reads a snapshot refreshed at the end of every control operation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ServiceConfig, SourceValue};
use crate::detect::DetectorProvider;
use crate::error::{PresenceError, Result};
use crate::event::EventEmitter;
use crate::ingest::{source_tag, DefaultSourceOpener, FrameSource, SourceOpener};
use crate::pipeline::{
    shutdown_channel, DetectionLoop, FrameWorker, LoopReport, LoopSettings, ShutdownTrigger,
};
use crate::presence::TrackerSettings;
use crate::snapshot::{JpegDirectorySink, SnapshotSink, SnapshotThrottler};

/// Builds the snapshot sink for each loop start.
pub type SnapshotSinkFactory =
    Arc<dyn Fn() -> anyhow::Result<Box<dyn SnapshotSink>> + Send + Sync>;

/// Observable service state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub camera_id: String,
    pub source: String,
    pub imgsz: u32,
    pub conf: f32,
    pub stride: u32,
    pub max_fps: f64,
    pub snap_every_s: f64,
    pub device: String,
    pub model: String,
}

/// Partial parameter update. Absent fields keep their current value;
/// unrecognized keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ParamUpdate {
    pub source: Option<SourceValue>,
    pub imgsz: Option<u32>,
    pub conf: Option<f32>,
    pub stride: Option<u32>,
    #[serde(alias = "maxFps")]
    pub max_fps: Option<f64>,
    #[serde(alias = "snapEveryS")]
    pub snap_every_s: Option<f64>,
    pub model: Option<String>,
    pub device: Option<String>,
}

impl ParamUpdate {
    /// Parse a JSON object of parameters. A recognized key with a value of the
    /// wrong type is rejected as `InvalidParams`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PresenceError::InvalidParams(e.to_string()))
    }

    /// Apply onto a copy of `config` and validate the result.
    fn applied_to(self, config: &ServiceConfig) -> Result<ServiceConfig> {
        let mut next = config.clone();
        if let Some(source) = self.source {
            next.camera.source = source.into_descriptor();
        }
        if let Some(imgsz) = self.imgsz {
            next.camera.imgsz = imgsz;
        }
        if let Some(conf) = self.conf {
            next.camera.conf = conf;
        }
        if let Some(stride) = self.stride {
            next.camera.stride = stride;
        }
        if let Some(max_fps) = self.max_fps {
            next.camera.max_fps = max_fps;
        }
        if let Some(snap_every_s) = self.snap_every_s {
            next.camera.snap_every_s = snap_every_s;
        }
        if let Some(model) = self.model {
            next.model.model = model;
        }
        if let Some(device) = self.device {
            next.model.device = device;
        }
        next.validate()?;
        Ok(next)
    }
}

struct ActiveLoop {
    trigger: ShutdownTrigger,
    handle: JoinHandle<Result<LoopReport>>,
}

struct Control {
    config: ServiceConfig,
    active: Option<ActiveLoop>,
}

struct StatusView {
    config: ServiceConfig,
    /// Liveness flag of the current loop; cleared by the loop task on exit.
    alive: Option<Arc<AtomicBool>>,
}

pub struct DetectorService {
    camera_id: String,
    tracker: TrackerSettings,
    static_mount: String,
    opener: Arc<dyn SourceOpener>,
    detectors: Arc<dyn DetectorProvider>,
    emitter: Arc<dyn EventEmitter>,
    snapshots: Option<SnapshotSinkFactory>,
    control: Mutex<Control>,
    status: RwLock<StatusView>,
}

impl DetectorService {
    /// A stopped service with the built-in source opener and no snapshots.
    pub fn new(
        camera_id: impl Into<String>,
        config: ServiceConfig,
        detectors: Arc<dyn DetectorProvider>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            tracker: TrackerSettings::default(),
            static_mount: "/static".to_string(),
            opener: Arc::new(DefaultSourceOpener),
            detectors,
            emitter,
            snapshots: None,
            status: RwLock::new(StatusView {
                config: config.clone(),
                alive: None,
            }),
            control: Mutex::new(Control {
                config,
                active: None,
            }),
        }
    }

    pub fn with_source_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerSettings) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_static_mount(mut self, static_mount: impl Into<String>) -> Self {
        self.static_mount = static_mount.into();
        self
    }

    /// Save throttled JPEG snapshots into `dir`.
    pub fn with_snapshot_dir(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.with_snapshot_sink(Arc::new(move || {
            Ok(Box::new(JpegDirectorySink::new(&dir)?) as Box<dyn SnapshotSink>)
        }))
    }

    pub fn with_snapshot_sink(mut self, factory: SnapshotSinkFactory) -> Self {
        self.snapshots = Some(factory);
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Start the detection loop. Starting a running service does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.start_locked(&mut control).await
    }

    /// Stop the detection loop and wait for it to release its source.
    /// Stopping a stopped service does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.stop_locked(&mut control).await;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.stop_locked(&mut control).await;
        self.start_locked(&mut control).await
    }

    /// Point the service at a new source and restart.
    pub async fn switch_source(&self, source: &str) -> Result<()> {
        let source = source.trim();
        if source.is_empty() {
            return Err(PresenceError::InvalidParams(
                "source must not be empty".to_string(),
            ));
        }
        let mut control = self.control.lock().await;
        control.config.camera.source = source.to_string();
        self.publish_config(&control.config);
        log::info!("[{}] switching source to {}", self.camera_id, source);
        self.stop_locked(&mut control).await;
        self.start_locked(&mut control).await
    }

    /// Merge `update` into the config and restart. An invalid value rejects the
    /// whole update: config is unchanged and the loop is left as it was.
    pub async fn update_params(&self, update: ParamUpdate) -> Result<()> {
        let mut control = self.control.lock().await;
        let next = update.applied_to(&control.config)?;
        control.config = next;
        self.publish_config(&control.config);
        log::info!("[{}] parameters updated, restarting", self.camera_id);
        self.stop_locked(&mut control).await;
        self.start_locked(&mut control).await
    }

    pub fn status(&self) -> ServiceStatus {
        let view = match self.status.read() {
            Ok(view) => view,
            Err(poisoned) => poisoned.into_inner(),
        };
        let camera = &view.config.camera;
        ServiceStatus {
            running: view
                .alive
                .as_ref()
                .is_some_and(|alive| alive.load(Ordering::SeqCst)),
            camera_id: self.camera_id.clone(),
            source: camera.source.clone(),
            imgsz: camera.imgsz,
            conf: camera.conf,
            stride: camera.stride,
            max_fps: camera.max_fps,
            snap_every_s: camera.snap_every_s,
            device: view.config.model.device.clone(),
            model: view.config.model.model.clone(),
        }
    }

    /// Current config, waiting for any in-flight control operation.
    pub async fn config(&self) -> ServiceConfig {
        self.control.lock().await.config.clone()
    }

    async fn start_locked(&self, control: &mut Control) -> Result<()> {
        match &control.active {
            Some(active) if !active.handle.is_finished() => return Ok(()),
            Some(_) => {
                // The loop ended on its own; collect it before starting a new one.
                log::warn!("[{}] detection loop had exited, restarting", self.camera_id);
                self.stop_locked(control).await;
            }
            None => {}
        }
        let config = control.config.clone();

        let opener = self.opener.clone();
        let source = config.camera.source.clone();
        let stride = config.camera.stride;
        let frame_source =
            tokio::task::spawn_blocking(move || FrameSource::open(opener.as_ref(), &source, stride))
                .await??;

        let detectors = self.detectors.clone();
        let model = config.model.clone();
        let detector = tokio::task::spawn_blocking(move || detectors.load(&model))
            .await?
            .map_err(|e| PresenceError::ModelUnavailable {
                model: config.model.model.clone(),
                reason: format!("{:#}", e),
            })?;

        let throttler = match &self.snapshots {
            Some(factory) => match factory() {
                Ok(sink) => Some(SnapshotThrottler::new(sink, config.camera.snap_every_s)),
                Err(e) => {
                    log::warn!(
                        "[{}] snapshots disabled for this run: {:#}",
                        self.camera_id,
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let settings = LoopSettings {
            camera_id: self.camera_id.clone(),
            source_tag: source_tag(&config.camera.source).to_string(),
            inference: config.inference_params(),
            max_fps: config.camera.max_fps,
            static_mount: self.static_mount.clone(),
        };
        let worker = FrameWorker::new(frame_source, detector, self.tracker, throttler, settings);
        let detection_loop = DetectionLoop::new(worker, self.emitter.clone());

        let (trigger, signal) = shutdown_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let handle = tokio::spawn(async move {
            let result = detection_loop.run(signal).await;
            flag.store(false, Ordering::SeqCst);
            result
        });

        control.active = Some(ActiveLoop { trigger, handle });
        self.publish(&control.config, Some(alive));
        log::info!(
            "[{}] detector started on {} (model {}, device {})",
            self.camera_id,
            config.camera.source,
            config.model.model,
            config.model.device
        );
        Ok(())
    }

    async fn stop_locked(&self, control: &mut Control) {
        let Some(active) = control.active.as_mut() else {
            return;
        };
        active.trigger.trigger();
        // Awaited by reference: if this future is dropped mid-wait the loop
        // stays tracked and the next stop waits for it again.
        match (&mut active.handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("[{}] detection loop ended with error: {}", self.camera_id, e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => log::error!("[{}] detection loop task failed: {}", self.camera_id, e),
        }
        control.active = None;
        self.publish(&control.config, None);
        log::info!("[{}] detector stopped", self.camera_id);
    }

    fn publish_config(&self, config: &ServiceConfig) {
        let mut view = match self.status.write() {
            Ok(view) => view,
            Err(poisoned) => poisoned.into_inner(),
        };
        view.config = config.clone();
    }

    fn publish(&self, config: &ServiceConfig, alive: Option<Arc<AtomicBool>>) {
        let mut view = match self.status.write() {
            Ok(view) => view,
            Err(poisoned) => poisoned.into_inner(),
        };
        view.config = config.clone();
        view.alive = alive;
    }
}
