//! Presence Kernel
//!
//! This crate implements a continuous person-presence pipeline: it reads a
//! live video source, detects people per frame, suppresses repeated reports
//! of the same stationary subject, attaches rate-limited snapshots, and fans
//! presence events out to persistence and live subscribers.
//!
//! # Architecture
//!
//! The pipeline keeps these properties by construction:
//!
//! 1. **One capture loop per camera**: lifecycle operations are serialized and a
//!    restart finishes releasing the old source before the new one is opened.
//! 2. **Release exactly once**: a frame source is closed on every exit path,
//!    including task cancellation and panics inside a step.
//! 3. **Dedup with keepalive**: a stationary subject is reported on appearance,
//!    on movement, and at most once per keepalive interval otherwise.
//! 4. **Isolated failures**: a failed inference skips a frame, a failed snapshot
//!    drops only the image, a broken subscriber is pruned without affecting
//!    the others.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (`stub://` synthetic scene, HTTP JPEG) and stride
//! - `detect`: detection adapter contract, registry, reference adapter
//! - `presence`: dedup/keepalive state machine
//! - `snapshot`: snapshot sinks and the throttler
//! - `pipeline`: the detection loop and its shutdown signal
//! - `service`: `DetectorService` lifecycle controller
//! - `still_image`: one-shot detection on uploaded JPEGs
//! - `broadcast`, `storage`, `emitter`: event fan-out and persistence

pub mod broadcast;
pub mod config;
pub mod detect;
pub mod emitter;
pub mod error;
pub mod event;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod presence;
pub mod service;
pub mod snapshot;
pub mod still_image;
pub mod storage;

pub use broadcast::{BroadcastReport, Broadcaster, ChannelSink, EventSink, SubscriberId};
pub use config::{CameraSettings, ModelSettings, PresenceConfig, ServiceConfig};
pub use detect::{
    BrightBlobDetector, Detection, DetectionAdapter, DetectorProvider, DetectorRegistry,
    InferenceParams,
};
pub use emitter::StoreAndBroadcast;
pub use error::{PresenceError, Result};
pub use event::{EventEmitter, PresenceEvent};
pub use frame::Frame;
pub use geometry::{iou, BBox};
pub use ingest::{DefaultSourceOpener, FrameSource, SourceOpener, VideoBackend};
pub use pipeline::{shutdown_channel, DetectionLoop, ShutdownSignal, ShutdownTrigger};
pub use presence::{PresenceDecision, PresenceTracker, TrackerSettings};
pub use service::{DetectorService, ParamUpdate, ServiceStatus};
pub use snapshot::{JpegDirectorySink, SnapshotSink, SnapshotThrottler};
pub use still_image::{StillImage, StillImageDetector, StillImageQueue};
pub use storage::{EventStore, SqliteEventStore};
