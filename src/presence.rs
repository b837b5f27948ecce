//! Presence dedup/keepalive state machine.
//!
//! One tracker exists per running camera loop. For every processed frame it
//! receives that frame's detections and decides whether a presence event is
//! emitted:
//!
//! - `Absent -> Present` always emits (new appearance).
//! - While `Present`, an emission happens when the best box moved
//!   (`iou < iou_same`) or the keepalive interval elapsed since the last
//!   emission. `last_bbox` follows the subject on every frame, emitting or not.
//! - A frame without person detections returns to `Absent` silently.

use crate::detect::{persons, Detection};
use crate::geometry::{iou, BBox};

pub const DEFAULT_IOU_SAME: f64 = 0.6;
pub const DEFAULT_KEEPALIVE_S: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PresenceState {
    Absent,
    Present {
        last_bbox: BBox,
        last_emit_ts: f64,
    },
}

/// Why a frame produced an emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitReason {
    Appeared,
    Moved,
    KeepAlive,
}

/// Outcome of one processed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PresenceDecision {
    /// No person in the frame.
    Absent,
    /// Person present, nothing new to announce.
    Suppressed { bbox: BBox },
    /// Person present and an event must be emitted for `bbox`.
    Emit { bbox: BBox, reason: EmitReason },
}

impl PresenceDecision {
    pub fn emitted_bbox(&self) -> Option<BBox> {
        match self {
            PresenceDecision::Emit { bbox, .. } => Some(*bbox),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerSettings {
    pub iou_same: f64,
    pub keepalive_s: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            iou_same: DEFAULT_IOU_SAME,
            keepalive_s: DEFAULT_KEEPALIVE_S,
        }
    }
}

#[derive(Debug)]
pub struct PresenceTracker {
    settings: TrackerSettings,
    state: PresenceState,
}

impl PresenceTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            state: PresenceState::Absent,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = PresenceState::Absent;
    }

    /// Feed one frame's detections (any classes) observed at `now` (seconds).
    pub fn observe(&mut self, detections: &[Detection], now: f64) -> PresenceDecision {
        let Some(best) = best_person(detections) else {
            self.state = PresenceState::Absent;
            return PresenceDecision::Absent;
        };
        let bbox = best.bbox;

        match self.state {
            PresenceState::Absent => {
                self.state = PresenceState::Present {
                    last_bbox: bbox,
                    last_emit_ts: now,
                };
                PresenceDecision::Emit {
                    bbox,
                    reason: EmitReason::Appeared,
                }
            }
            PresenceState::Present {
                last_bbox,
                last_emit_ts,
            } => {
                let moved = iou(&bbox, &last_bbox) < self.settings.iou_same;
                let stale = now - last_emit_ts >= self.settings.keepalive_s;
                let decision = if moved || stale {
                    PresenceDecision::Emit {
                        bbox,
                        reason: if moved {
                            EmitReason::Moved
                        } else {
                            EmitReason::KeepAlive
                        },
                    }
                } else {
                    PresenceDecision::Suppressed { bbox }
                };
                let last_emit_ts = if decision.emitted_bbox().is_some() {
                    now
                } else {
                    last_emit_ts
                };
                self.state = PresenceState::Present {
                    last_bbox: bbox,
                    last_emit_ts,
                };
                decision
            }
        }
    }
}

/// Highest-scoring person detection; ties keep the first one encountered.
pub(crate) fn best_person(detections: &[Detection]) -> Option<&Detection> {
    persons(detections).fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.score >= d.score => Some(b),
        _ => Some(d),
    })
}
