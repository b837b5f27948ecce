//! Detection on uploaded still images.
//!
//! Cameras that push JPEG snapshots (ESP32 uploads) bypass the continuous
//! loop: each image is decoded, run through the detection adapter once, and
//! reported when it contains a person. There is no dedup or keepalive; every
//! upload stands alone. The uploaded file itself is the event's snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::detect::{DetectionAdapter, InferenceParams};
use crate::error::{PresenceError, Result};
use crate::event::{now_s, EventEmitter, PresenceEvent};
use crate::frame::Frame;
use crate::pipeline::{detect_guarded, Clock};
use crate::presence::best_person;

/// Event `source` tag for uploaded images.
pub const UPLOAD_SOURCE_TAG: &str = "esp32";

/// One uploaded image awaiting detection.
#[derive(Clone, Debug)]
pub struct StillImage {
    pub path: PathBuf,
    pub camera_id: String,
}

impl StillImage {
    pub fn new(path: impl Into<PathBuf>, camera_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            camera_id: camera_id.into(),
        }
    }
}

/// Runs one detection pass per uploaded image.
pub struct StillImageDetector {
    detector: Box<dyn DetectionAdapter>,
    inference: InferenceParams,
    /// URL prefix under which upload files are served.
    snapshot_mount: String,
    clock: Clock,
}

impl StillImageDetector {
    pub fn new(detector: Box<dyn DetectionAdapter>, inference: InferenceParams) -> Self {
        Self {
            detector,
            inference,
            snapshot_mount: "/static/snapshots".to_string(),
            clock: Arc::new(now_s),
        }
    }

    pub fn with_snapshot_mount(mut self, mount: impl Into<String>) -> Self {
        self.snapshot_mount = mount.into();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Detect on `upload`. `Ok(None)` when no person is in it.
    ///
    /// The event timestamp is taken when processing starts, before decoding.
    pub fn process(&mut self, upload: &StillImage) -> anyhow::Result<Option<PresenceEvent>> {
        let ts = (self.clock)();
        let decoded = image::open(&upload.path)
            .with_context(|| format!("decode {}", upload.path.display()))?;
        let frame = Frame::from_image(decoded.into_rgb8(), 0);
        let detections = detect_guarded(self.detector.as_mut(), &frame, &self.inference)?;
        let Some(best) = best_person(&detections) else {
            return Ok(None);
        };
        let snapshot_url = self.snapshot_url(&upload.path)?;
        Ok(Some(PresenceEvent::new(
            ts,
            &upload.camera_id,
            UPLOAD_SOURCE_TAG,
            best.bbox,
            Some(snapshot_url),
        )))
    }

    fn snapshot_url(&self, path: &Path) -> anyhow::Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("upload path {} has no file name", path.display()))?;
        Ok(format!(
            "{}/{}",
            self.snapshot_mount.trim_end_matches('/'),
            name
        ))
    }
}

/// Handle for submitting uploads to a background `StillImageDetector`.
///
/// Images are processed one at a time in submission order. A failed image
/// is logged and skipped. The worker ends when every handle is dropped and
/// returns the number of events it emitted.
#[derive(Clone)]
pub struct StillImageQueue {
    tx: mpsc::Sender<StillImage>,
}

impl StillImageQueue {
    pub fn spawn(
        detector: StillImageDetector,
        emitter: Arc<dyn EventEmitter>,
        capacity: usize,
    ) -> (Self, JoinHandle<u64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_queue(detector, emitter, rx));
        (Self { tx }, handle)
    }

    /// Queue `image`; waits while the queue is full.
    pub async fn submit(&self, image: StillImage) -> Result<()> {
        self.tx
            .send(image)
            .await
            .map_err(|_| PresenceError::Task("still image worker has exited".to_string()))
    }
}

async fn run_queue(
    detector: StillImageDetector,
    emitter: Arc<dyn EventEmitter>,
    mut rx: mpsc::Receiver<StillImage>,
) -> u64 {
    let mut detector = detector;
    let mut emitted = 0u64;
    while let Some(image) = rx.recv().await {
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = detector.process(&image);
            (detector, image, outcome)
        })
        .await;
        let (returned, image, outcome) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                log::error!("still image worker lost its detector: {}", e);
                return emitted;
            }
        };
        detector = returned;
        match outcome {
            Ok(Some(event)) => {
                emitter.emit(event).await;
                emitted += 1;
            }
            Ok(None) => log::debug!("[{}] no person in {}", image.camera_id, image.path.display()),
            Err(e) => log::warn!("[{}] upload skipped: {:#}", image.camera_id, e),
        }
    }
    emitted
}
