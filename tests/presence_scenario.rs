//! End-to-end presence scenarios driven through `FrameWorker` with a scripted clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use presence_kernel::detect::{Detection, InferenceParams};
use presence_kernel::ingest::SyntheticBackend;
use presence_kernel::pipeline::{FrameWorker, LoopSettings, Step};
use presence_kernel::{
    BBox, BrightBlobDetector, DetectionAdapter, Frame, FrameSource, PresenceEvent,
    SnapshotSink, SnapshotThrottler, SourceOpener, TrackerSettings, VideoBackend,
};

struct Synthetic;

impl SourceOpener for Synthetic {
    fn open(&self, source: &str) -> anyhow::Result<Box<dyn VideoBackend>> {
        Ok(Box::new(SyntheticBackend::with_size(source, 128, 96)))
    }
}

/// Returns a fixed detection list per processed frame.
struct Scripted {
    frames: Vec<Vec<Detection>>,
    next: usize,
}

impl DetectionAdapter for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame, _p: &InferenceParams) -> anyhow::Result<Vec<Detection>> {
        let out = self.frames.get(self.next).cloned().unwrap_or_default();
        self.next += 1;
        Ok(out)
    }
}

struct CountingSink {
    writes: Arc<AtomicUsize>,
}

impl SnapshotSink for CountingSink {
    fn write(&mut self, frame: &Frame) -> anyhow::Result<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(format!("snapshots/person_{:08x}.jpg", frame.sequence))
    }
}

fn settings() -> LoopSettings {
    LoopSettings {
        camera_id: "cam01".to_string(),
        source_tag: "webcam".to_string(),
        inference: InferenceParams {
            imgsz: 640,
            conf: 0.45,
            device: "cpu".to_string(),
        },
        max_fps: 15.0,
        static_mount: "/static".to_string(),
    }
}

fn scripted_clock(times: Vec<f64>) -> Arc<dyn Fn() -> f64 + Send + Sync> {
    let times = Mutex::new(times.into_iter());
    Arc::new(move || times.lock().unwrap().next().unwrap_or(f64::MAX))
}

fn person(b: [i32; 4]) -> Detection {
    Detection::person(BBox::from(b), 0.9)
}

fn run(worker: &mut FrameWorker, frames: usize) -> Vec<(usize, PresenceEvent)> {
    (0..frames)
        .filter_map(|i| match worker.step() {
            Step::Event(ev) => Some((i, ev)),
            _ => None,
        })
        .collect()
}

#[test]
fn reference_scenario_emits_appearance_keepalive_and_reappearance() {
    let writes = Arc::new(AtomicUsize::new(0));
    let throttler = SnapshotThrottler::new(
        Box::new(CountingSink {
            writes: writes.clone(),
        }),
        3.0,
    );
    let detector = Scripted {
        frames: vec![
            vec![person([100, 120, 260, 420])],
            vec![person([102, 121, 259, 419])],
            vec![person([102, 121, 259, 419])],
            vec![],
            vec![person([10, 10, 50, 50])],
        ],
        next: 0,
    };
    let mut worker = FrameWorker::new(
        FrameSource::open(&Synthetic, "scene", 1).unwrap(),
        Box::new(detector),
        TrackerSettings::default(),
        Some(throttler),
        settings(),
    )
    .with_clock(scripted_clock(vec![0.0, 1.0, 5.1, 6.0, 7.0]));

    let events = run(&mut worker, 5);
    let frames: Vec<usize> = events.iter().map(|(i, _)| *i).collect();
    assert_eq!(frames, vec![0, 2, 4]);

    let (_, first) = &events[0];
    assert_eq!(first.ts, 0.0);
    assert_eq!(first.bbox, BBox::new(100, 120, 260, 420));
    assert_eq!(first.source, "webcam");
    assert_eq!(
        first.snapshot_url.as_deref(),
        Some("/static/snapshots/person_00000000.jpg")
    );

    let (_, keepalive) = &events[1];
    assert_eq!(keepalive.ts, 5.1);
    assert_eq!(keepalive.bbox, BBox::new(102, 121, 259, 419));
    assert!(keepalive.snapshot_url.is_some());

    // 1.9 s after the previous snapshot: event goes out without one.
    let (_, reappeared) = &events[2];
    assert_eq!(reappeared.ts, 7.0);
    assert_eq!(reappeared.bbox, BBox::new(10, 10, 50, 50));
    assert_eq!(reappeared.snapshot_url, None);
    assert_eq!(writes.load(Ordering::SeqCst), 2);

    assert!(events.iter().all(|(_, ev)| ev.person.is_none()));
    assert_ne!(events[0].1.id, events[1].1.id);
}

#[test]
fn synthetic_scene_reports_each_appearance() {
    // 0.1 s per frame over one 200-frame script: present (still, then walking),
    // absent for frames 100..140, then present again.
    let times: Vec<f64> = (0..200).map(|i| i as f64 * 0.1).collect();
    let mut worker = FrameWorker::new(
        FrameSource::open(&Synthetic, "scene", 1).unwrap(),
        Box::new(BrightBlobDetector::default()),
        TrackerSettings::default(),
        None,
        settings(),
    )
    .with_clock(scripted_clock(times));

    let frames: Vec<usize> = run(&mut worker, 200).into_iter().map(|(i, _)| i).collect();
    assert_eq!(frames.first(), Some(&0));
    assert!(frames.contains(&140));
    assert!(frames.iter().all(|i| !(100..140).contains(i)));
    // Slow walking never reads as a new subject; only keepalives in between.
    assert!(frames.iter().filter(|i| (1..100).contains(*i)).count() <= 2);
}

#[test]
fn stride_skips_frames_between_detections() {
    let detector = Scripted {
        frames: vec![vec![person([0, 0, 10, 10])]; 3],
        next: 0,
    };
    let mut worker = FrameWorker::new(
        FrameSource::open(&Synthetic, "scene", 4).unwrap(),
        Box::new(detector),
        TrackerSettings::default(),
        None,
        settings(),
    )
    .with_clock(scripted_clock(vec![0.0, 0.1, 0.2]));
    let events = run(&mut worker, 3);
    assert_eq!(events.len(), 1);
}
