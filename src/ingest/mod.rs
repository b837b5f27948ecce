//! Frame ingestion.
//!
//! This module provides the camera side of the detection loop:
//! - `VideoBackend`: the capture contract (read, skip, close) a device or stream implements
//! - `SourceOpener`: resolves a source descriptor to a backend
//! - `FrameSource`: owns one open backend, applies stride decimation, and
//!   guarantees the backend is closed exactly once
//!
//! Built-in backends:
//! - `stub://<name>` synthetic scene (testing and demos)
//! - `http(s)://` MJPEG or single-JPEG endpoints (feature: ingest-http)

#[cfg(feature = "ingest-http")]
pub mod http;
pub mod synthetic;

use anyhow::{anyhow, Result};

use crate::error::PresenceError;
use crate::frame::Frame;

#[cfg(feature = "ingest-http")]
pub use http::HttpJpegBackend;
pub use synthetic::SyntheticBackend;

/// Capture backend for one opened device or stream.
///
/// All calls are blocking. The detection loop runs them off the async scheduler.
pub trait VideoBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Read the next frame. `Ok(None)` means no frame is available right now.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Grab and discard one frame. Backends with a cheaper grab path override this.
    fn skip(&mut self) -> Result<()> {
        self.read().map(|_| ())
    }

    /// Release the device. Called at most once by `FrameSource`.
    fn close(&mut self) {}
}

/// Resolves source descriptors to opened backends.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn VideoBackend>>;
}

/// Opener for the backends compiled into this crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceOpener;

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, source: &str) -> Result<Box<dyn VideoBackend>> {
        let source = source.trim();
        if let Some(name) = source.strip_prefix("stub://") {
            return Ok(Box::new(SyntheticBackend::new(name)));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            #[cfg(feature = "ingest-http")]
            {
                return Ok(Box::new(HttpJpegBackend::connect(source)?));
            }
            #[cfg(not(feature = "ingest-http"))]
            {
                return Err(anyhow!("http sources require the ingest-http feature"));
            }
        }
        if is_device_index(source) {
            return Err(anyhow!(
                "no local capture backend available for device index {}",
                source
            ));
        }
        Err(anyhow!("unsupported source descriptor '{}'", source))
    }
}

/// Tag recorded on events describing where frames came from.
pub fn source_tag(source: &str) -> &'static str {
    let source = source.trim();
    if is_device_index(source) {
        "webcam"
    } else if source.starts_with("stub://") {
        "stub"
    } else if source.starts_with("http://") || source.starts_with("https://") {
        "esp32"
    } else if source.starts_with("rtsp://") {
        "rtsp"
    } else {
        "file"
    }
}

fn is_device_index(source: &str) -> bool {
    !source.is_empty() && source.chars().all(|c| c.is_ascii_digit())
}

/// Frame statistics for an open source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub read_failures: u64,
}

/// Owns one open video backend for the lifetime of a detection loop.
pub struct FrameSource {
    backend: Option<Box<dyn VideoBackend>>,
    descriptor: String,
    stride: u32,
    stats: SourceStats,
}

impl FrameSource {
    /// Open `source` through `opener`. Any backend failure is reported as `SourceUnavailable`.
    pub fn open(opener: &dyn SourceOpener, source: &str, stride: u32) -> crate::Result<Self> {
        let backend = opener
            .open(source)
            .map_err(|e| PresenceError::source_unavailable(source, format!("{:#}", e)))?;
        log::info!(
            "FrameSource: opened {} via {} backend (stride {})",
            source,
            backend.name(),
            stride.max(1)
        );
        Ok(Self {
            backend: Some(backend),
            descriptor: source.to_string(),
            stride: stride.max(1),
            stats: SourceStats::default(),
        })
    }

    /// Read the next processed frame, discarding `stride - 1` frames first.
    ///
    /// Read failures are not fatal: they are counted and reported as `None`.
    pub fn read(&mut self) -> Option<Frame> {
        let backend = self.backend.as_mut()?;
        for _ in 1..self.stride {
            match backend.skip() {
                Ok(()) => self.stats.frames_skipped += 1,
                Err(e) => log::debug!("FrameSource: skip failed on {}: {}", self.descriptor, e),
            }
        }
        match backend.read() {
            Ok(Some(frame)) => {
                self.stats.frames_read += 1;
                Some(frame)
            }
            Ok(None) => None,
            Err(e) => {
                self.stats.read_failures += 1;
                log::debug!("FrameSource: read failed on {}: {}", self.descriptor, e);
                None
            }
        }
    }

    /// Release the backend. Safe to call repeatedly; only the first call reaches the backend.
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            log::info!(
                "FrameSource: closed {} ({} frames read, {} read failures)",
                self.descriptor,
                self.stats.frames_read,
                self.stats.read_failures
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingBackend {
        reads: Arc<AtomicUsize>,
        skips: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl VideoBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads {
                return Err(anyhow!("device gone"));
            }
            Ok(Some(Frame::from_rgb(vec![0; 12], 2, 2, 0)?))
        }

        fn skip(&mut self) -> Result<()> {
            self.skips.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Counters {
        reads: Arc<AtomicUsize>,
        skips: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct CountingOpener {
        counters: Counters,
        fail_reads: bool,
    }

    impl SourceOpener for CountingOpener {
        fn open(&self, source: &str) -> Result<Box<dyn VideoBackend>> {
            if source == "missing" {
                return Err(anyhow!("no such device"));
            }
            Ok(Box::new(CountingBackend {
                reads: self.counters.reads.clone(),
                skips: self.counters.skips.clone(),
                closes: self.counters.closes.clone(),
                fail_reads: self.fail_reads,
            }))
        }
    }

    #[test]
    fn stride_discards_frames_before_each_read() {
        let opener = CountingOpener {
            counters: Counters::default(),
            fail_reads: false,
        };
        let mut source = FrameSource::open(&opener, "cam", 3).unwrap();
        assert!(source.read().is_some());
        assert!(source.read().is_some());
        assert_eq!(opener.counters.skips.load(Ordering::SeqCst), 4);
        assert_eq!(opener.counters.reads.load(Ordering::SeqCst), 2);
        assert_eq!(source.stats().frames_skipped, 4);
    }

    #[test]
    fn read_failure_is_no_frame() {
        let opener = CountingOpener {
            counters: Counters::default(),
            fail_reads: true,
        };
        let mut source = FrameSource::open(&opener, "cam", 1).unwrap();
        assert!(source.read().is_none());
        assert_eq!(source.stats().read_failures, 1);
    }

    #[test]
    fn close_is_idempotent_and_runs_on_drop() {
        let opener = CountingOpener {
            counters: Counters::default(),
            fail_reads: false,
        };
        {
            let mut source = FrameSource::open(&opener, "cam", 1).unwrap();
            source.close();
            source.close();
            assert!(!source.is_open());
            assert!(source.read().is_none());
        }
        assert_eq!(opener.counters.closes.load(Ordering::SeqCst), 1);

        {
            let _source = FrameSource::open(&opener, "cam", 1).unwrap();
        }
        assert_eq!(opener.counters.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn open_failure_is_source_unavailable() {
        let opener = CountingOpener {
            counters: Counters::default(),
            fail_reads: false,
        };
        let err = FrameSource::open(&opener, "missing", 1)
            .err()
            .expect("open should fail");
        assert!(matches!(err, PresenceError::SourceUnavailable { .. }));
    }

    #[test]
    fn default_opener_resolves_stub_and_rejects_unknown() {
        let opener = DefaultSourceOpener;
        assert!(opener.open("stub://front").is_ok());
        assert!(opener.open("0").is_err());
        assert!(opener.open("/dev/null/video.mp4").is_err());
    }

    #[test]
    fn source_tags() {
        assert_eq!(source_tag("0"), "webcam");
        assert_eq!(source_tag("stub://x"), "stub");
        assert_eq!(source_tag("http://10.0.0.2/capture"), "esp32");
        assert_eq!(source_tag("rtsp://cam/stream"), "rtsp");
        assert_eq!(source_tag("clip.mp4"), "file");
    }
}
