//! The continuous detection loop.
//!
//! `FrameWorker` owns everything a camera loop touches synchronously (the
//! open frame source, the detector, presence state, the snapshot throttler)
//! and turns one frame into at most one event. `DetectionLoop` drives the
//! worker from async code: each step runs on the blocking pool, events go to
//! the emitter in decision order, and the loop yields between steps so a
//! shutdown is observed promptly.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use tokio::sync::watch;

use crate::detect::{Detection, DetectionAdapter, InferenceParams};
use crate::error::{PresenceError, Result};
use crate::event::{now_s, EventEmitter, PresenceEvent};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::presence::{PresenceDecision, PresenceTracker, TrackerSettings};
use crate::snapshot::SnapshotThrottler;

/// Cooperative yield after every iteration.
pub const ITERATION_YIELD: Duration = Duration::from_millis(20);
/// Backoff after a read that produced no frame.
pub const NO_FRAME_BACKOFF: Duration = Duration::from_secs(1);

/// Wall-clock source, in seconds. Replaced in tests to script time.
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Creates a linked trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Requests a loop stop. Dropping the trigger also stops the loop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation token observed by the loop at iteration boundaries.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns true when cancelled.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancelled() => true,
        };
        cancelled || self.is_cancelled()
    }
}

/// Immutable per-loop settings, captured when the loop is built.
#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub camera_id: String,
    /// Event `source` tag.
    pub source_tag: String,
    pub inference: InferenceParams,
    pub max_fps: f64,
    /// URL prefix joined with snapshot paths.
    pub static_mount: String,
}

impl LoopSettings {
    fn min_period(&self) -> Duration {
        if self.max_fps > 0.0 && self.max_fps.is_finite() {
            Duration::from_secs_f64(1.0 / self.max_fps)
        } else {
            Duration::ZERO
        }
    }

    fn snapshot_url(&self, relative: &str) -> String {
        format!("{}/{}", self.static_mount.trim_end_matches('/'), relative)
    }
}

/// Result of one worker step.
#[derive(Debug)]
pub enum Step {
    /// The source had nothing to read.
    NoFrame,
    /// A frame was processed and nothing was emitted.
    Processed,
    /// The detector failed on this frame; it was skipped.
    InferenceFailed,
    /// A frame was processed and produced an event.
    Event(PresenceEvent),
}

/// Counters reported when a loop ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub frames_processed: u64,
    pub empty_reads: u64,
    pub inference_failures: u64,
    pub events_emitted: u64,
}

pub struct FrameWorker {
    source: FrameSource,
    detector: Box<dyn DetectionAdapter>,
    tracker: PresenceTracker,
    throttler: Option<SnapshotThrottler>,
    settings: LoopSettings,
    clock: Clock,
}

impl FrameWorker {
    pub fn new(
        source: FrameSource,
        detector: Box<dyn DetectionAdapter>,
        tracker: TrackerSettings,
        throttler: Option<SnapshotThrottler>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            detector,
            tracker: PresenceTracker::new(tracker),
            throttler,
            settings,
            clock: Arc::new(now_s),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Read, detect, decide; blocking.
    pub fn step(&mut self) -> Step {
        let Some(frame) = self.source.read() else {
            return Step::NoFrame;
        };
        // A panicking adapter costs one frame, like any other inference error.
        let outcome = detect_guarded(self.detector.as_mut(), &frame, &self.settings.inference);
        let detections = match outcome {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!(
                    "[{}] inference failed on frame {}: {:#}",
                    self.settings.camera_id,
                    frame.sequence,
                    e
                );
                return Step::InferenceFailed;
            }
        };
        let now = (self.clock)();
        let bbox = match self.tracker.observe(&detections, now) {
            PresenceDecision::Emit { bbox, .. } => bbox,
            PresenceDecision::Suppressed { .. } | PresenceDecision::Absent => {
                return Step::Processed
            }
        };
        let snapshot_url = self
            .throttler
            .as_mut()
            .and_then(|t| t.maybe_capture(&frame, now))
            .map(|rel| self.settings.snapshot_url(&rel));
        Step::Event(PresenceEvent::new(
            now,
            &self.settings.camera_id,
            &self.settings.source_tag,
            bbox,
            snapshot_url,
        ))
    }

    /// Release the frame source. Also happens on drop.
    pub fn close(&mut self) {
        self.source.close();
    }
}

/// Run `detector` on `frame`, turning a panic inside the adapter into an error.
pub(crate) fn detect_guarded(
    detector: &mut dyn DetectionAdapter,
    frame: &Frame,
    params: &InferenceParams,
) -> anyhow::Result<Vec<Detection>> {
    panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame, params)))
        .unwrap_or_else(|payload| Err(anyhow!("detector panicked: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// One camera's detection loop, bound to an emitter.
pub struct DetectionLoop {
    worker: FrameWorker,
    emitter: Arc<dyn EventEmitter>,
}

impl DetectionLoop {
    pub fn new(worker: FrameWorker, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { worker, emitter }
    }

    /// Run until `shutdown` fires. The frame source is released on every exit path:
    /// explicitly on normal exit, and by `FrameSource`'s drop if the worker is lost
    /// to a panic inside a step.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<LoopReport> {
        let DetectionLoop { worker, emitter } = self;
        let camera_id = worker.settings().camera_id.clone();
        let min_period = worker.settings().min_period();
        let mut report = LoopReport::default();
        let mut worker = worker;

        log::info!(
            "[{}] detection loop started (source tag {})",
            camera_id,
            worker.settings().source_tag
        );

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let (returned, step) = tokio::task::spawn_blocking(move || {
                let step = worker.step();
                (worker, step)
            })
            .await
            .map_err(|e| PresenceError::Task(format!("detection step failed: {}", e)))?;
            worker = returned;

            let pause = match step {
                Step::NoFrame => {
                    report.empty_reads += 1;
                    log::debug!("[{}] no frame, backing off", camera_id);
                    NO_FRAME_BACKOFF
                }
                Step::InferenceFailed => {
                    report.inference_failures += 1;
                    ITERATION_YIELD
                }
                Step::Processed => {
                    report.frames_processed += 1;
                    ITERATION_YIELD.max(min_period.saturating_sub(started.elapsed()))
                }
                Step::Event(event) => {
                    report.frames_processed += 1;
                    report.events_emitted += 1;
                    log::info!(
                        "[{}] event {} bbox={:?} snapshot={}",
                        camera_id,
                        event.id,
                        event.bbox.to_array(),
                        event.snapshot_url.as_deref().unwrap_or("-")
                    );
                    emitter.emit(event).await;
                    ITERATION_YIELD.max(min_period.saturating_sub(started.elapsed()))
                }
            };

            if shutdown.sleep(pause).await {
                break;
            }
        }

        worker.close();
        log::info!(
            "[{}] detection loop stopped: {} frames, {} events, {} inference failures",
            camera_id,
            report.frames_processed,
            report.events_emitted,
            report.inference_failures
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BrightBlobDetector;
    use crate::geometry::BBox;
    use crate::ingest::{SourceOpener, SyntheticBackend, VideoBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct SyntheticOpener;

    impl SourceOpener for SyntheticOpener {
        fn open(&self, source: &str) -> anyhow::Result<Box<dyn VideoBackend>> {
            Ok(Box::new(SyntheticBackend::with_size(source, 64, 48)))
        }
    }

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<PresenceEvent>>,
    }

    #[async_trait]
    impl EventEmitter for Collect {
        async fn emit(&self, event: PresenceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Fails every other call.
    struct Flaky {
        calls: AtomicUsize,
    }

    impl DetectionAdapter for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn detect(&mut self, _frame: &Frame, _p: &InferenceParams) -> anyhow::Result<Vec<Detection>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(anyhow!("gpu hiccup"))
            } else {
                Ok(vec![Detection::person(BBox::new(0, 0, 10, 10), 0.9)])
            }
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            camera_id: "cam01".to_string(),
            source_tag: "stub".to_string(),
            inference: InferenceParams {
                imgsz: 640,
                conf: 0.45,
                device: "cpu".to_string(),
            },
            max_fps: 1000.0,
            static_mount: "/static/".to_string(),
        }
    }

    fn worker(detector: Box<dyn DetectionAdapter>) -> FrameWorker {
        let source = FrameSource::open(&SyntheticOpener, "t", 1).unwrap();
        FrameWorker::new(
            source,
            detector,
            TrackerSettings::default(),
            None,
            settings(),
        )
    }

    #[test]
    fn first_frame_emits_then_stationary_frames_are_suppressed() {
        let tick = Arc::new(AtomicU64::new(0));
        let t = tick.clone();
        let mut w = worker(Box::new(BrightBlobDetector::default()))
            .with_clock(Arc::new(move || t.fetch_add(1, Ordering::SeqCst) as f64 * 0.1));

        let Step::Event(ev) = w.step() else {
            panic!("first frame must emit");
        };
        assert_eq!(ev.camera_id, "cam01");
        assert_eq!(ev.source, "stub");
        assert_eq!(ev.snapshot_url, None);
        assert!(ev.person.is_none());
        // Jittering but stationary subject for the next frames, well within keepalive.
        for _ in 0..10 {
            assert!(matches!(w.step(), Step::Processed));
        }
    }

    #[test]
    fn inference_failure_skips_the_frame() {
        let mut w = worker(Box::new(Flaky {
            calls: AtomicUsize::new(0),
        }));
        assert!(matches!(w.step(), Step::InferenceFailed));
        assert!(matches!(w.step(), Step::Event(_)));
        assert!(matches!(w.step(), Step::InferenceFailed));
    }

    struct Panicky;

    impl DetectionAdapter for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn detect(&mut self, _frame: &Frame, _p: &InferenceParams) -> anyhow::Result<Vec<Detection>> {
            panic!("model runtime crashed");
        }
    }

    #[test]
    fn detector_panic_is_an_inference_failure() {
        let mut w = worker(Box::new(Panicky));
        assert!(matches!(w.step(), Step::InferenceFailed));
        assert!(matches!(w.step(), Step::InferenceFailed));
        assert!(w.source.is_open());
    }

    #[test]
    fn snapshot_url_joins_mount() {
        assert_eq!(
            settings().snapshot_url("snapshots/person_1.jpg"),
            "/static/snapshots/person_1.jpg"
        );
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown_and_reports() {
        let collect = Arc::new(Collect::default());
        let detection_loop =
            DetectionLoop::new(worker(Box::new(BrightBlobDetector::default())), collect.clone());
        let (trigger, signal) = shutdown_channel();
        let handle = tokio::spawn(detection_loop.run(signal));

        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
        let report = handle.await.unwrap().unwrap();

        assert!(report.frames_processed >= 1);
        let events = collect.events.lock().unwrap();
        assert_eq!(events.len() as u64, report.events_emitted);
        assert!(!events.is_empty());
        assert!(events.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[tokio::test]
    async fn dropped_trigger_stops_the_loop() {
        let collect = Arc::new(Collect::default());
        let detection_loop =
            DetectionLoop::new(worker(Box::new(BrightBlobDetector::default())), collect);
        let (trigger, signal) = shutdown_channel();
        drop(trigger);
        let report = detection_loop.run(signal).await.unwrap();
        assert_eq!(report, LoopReport::default());
    }
}
