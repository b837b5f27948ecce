//! Rate-limited frame snapshots.
//!
//! The throttler decides *when* a frame may be persisted (at most once per
//! `snap_every_s`); the sink decides *where*. A throttled or failed capture
//! never holds back the event it would have been attached to.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub const DEFAULT_SNAP_EVERY_S: f64 = 3.0;

/// Destination for snapshot frames.
pub trait SnapshotSink: Send {
    /// Persist `frame`, returning its path relative to the served static root.
    fn write(&mut self, frame: &Frame) -> Result<String>;
}

/// Writes snapshots as `person_<8 hex>.jpg` into a directory.
pub struct JpegDirectorySink {
    dir: PathBuf,
    relative_prefix: String,
}

impl JpegDirectorySink {
    /// Create the directory if needed. Returned paths are prefixed with the
    /// directory's own name (`data/snapshots` gives `snapshots/person_....jpg`).
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
        let relative_prefix = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("snapshots")
            .to_string();
        Ok(Self {
            dir,
            relative_prefix,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotSink for JpegDirectorySink {
    fn write(&mut self, frame: &Frame) -> Result<String> {
        let file_name = format!("person_{}.jpg", hex::encode(rand::random::<[u8; 4]>()));
        let path = self.dir.join(&file_name);
        frame
            .to_image()?
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .map_err(|e| anyhow!("write snapshot {}: {}", path.display(), e))?;
        Ok(format!("{}/{}", self.relative_prefix, file_name))
    }
}

/// Per-camera snapshot rate limiter.
pub struct SnapshotThrottler {
    sink: Box<dyn SnapshotSink>,
    snap_every_s: f64,
    last_snapshot_ts: Option<f64>,
}

impl SnapshotThrottler {
    pub fn new(sink: Box<dyn SnapshotSink>, snap_every_s: f64) -> Self {
        Self {
            sink,
            snap_every_s,
            last_snapshot_ts: None,
        }
    }

    pub fn is_due(&self, now: f64) -> bool {
        match self.last_snapshot_ts {
            Some(last) => now - last >= self.snap_every_s,
            None => true,
        }
    }

    /// Persist `frame` if at least `snap_every_s` passed since the last capture.
    ///
    /// The capture slot is consumed even when the sink fails, so a broken sink
    /// is retried at the normal cadence rather than on every frame.
    pub fn maybe_capture(&mut self, frame: &Frame, now: f64) -> Option<String> {
        if !self.is_due(now) {
            return None;
        }
        self.last_snapshot_ts = Some(now);
        match self.sink.write(frame) {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("snapshot capture failed: {:#}", e);
                None
            }
        }
    }
}
