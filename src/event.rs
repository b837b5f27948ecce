//! Presence events and the emitter contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::geometry::BBox;

/// Message type tag subscribers see on every presence event.
pub const PERSON_EVENT_TYPE: &str = "person_event";

/// Identity placeholder. Identity resolution is not performed; events carry `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One emitted presence event. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub id: String,
    /// Wall-clock seconds since the Unix epoch.
    pub ts: f64,
    pub camera_id: String,
    /// Frame origin tag (`webcam`, `esp32`, `stub`, ...).
    pub source: String,
    pub bbox: BBox,
    pub snapshot_url: Option<String>,
    pub person: Option<PersonRef>,
}

impl PresenceEvent {
    /// Build an event with a fresh id.
    pub fn new(
        ts: f64,
        camera_id: &str,
        source: &str,
        bbox: BBox,
        snapshot_url: Option<String>,
    ) -> Self {
        Self {
            id: new_event_id(),
            ts,
            camera_id: camera_id.to_string(),
            source: source.to_string(),
            bbox,
            snapshot_url,
            person: None,
        }
    }

    /// JSON message delivered to live subscribers: the event fields plus `"type"`.
    pub fn to_wire_json(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "type".to_string(),
                serde_json::Value::String(PERSON_EVENT_TYPE.to_string()),
            );
        }
        serde_json::to_string(&value)
    }
}

/// `evt_` followed by 128 random bits in hex.
pub fn new_event_id() -> String {
    format!("evt_{}", hex::encode(rand::random::<[u8; 16]>()))
}

/// Wall-clock seconds as a float. Clock errors (pre-epoch) collapse to 0.
pub fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Sink the detection loop hands finished events to.
///
/// Implementations own their failure handling: a persistence or delivery
/// problem must be logged and absorbed, never returned to the loop.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: PresenceEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let ids: HashSet<String> = (0..1000).map(|_| new_event_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.starts_with("evt_") && id.len() == 36));
    }

    #[test]
    fn wire_json_matches_schema() {
        let ev = PresenceEvent::new(
            12.5,
            "cam01",
            "webcam",
            BBox::new(100, 120, 260, 420),
            Some("/static/snapshots/person_0a0b0c0d.jpg".to_string()),
        );
        let value: serde_json::Value = serde_json::from_str(&ev.to_wire_json().unwrap()).unwrap();
        assert_eq!(value["type"], "person_event");
        assert_eq!(value["id"], ev.id.as_str());
        assert_eq!(value["ts"], 12.5);
        assert_eq!(value["camera_id"], "cam01");
        assert_eq!(value["source"], "webcam");
        assert_eq!(value["bbox"], serde_json::json!([100, 120, 260, 420]));
        assert_eq!(value["snapshot_url"], "/static/snapshots/person_0a0b0c0d.jpg");
        assert!(value["person"].is_null());
    }

    #[test]
    fn deserializes_from_wire_json() {
        let ev = PresenceEvent::new(1.0, "cam01", "stub", BBox::new(1, 2, 3, 4), None);
        let back: PresenceEvent = serde_json::from_str(&ev.to_wire_json().unwrap()).unwrap();
        assert_eq!(back, ev);
    }
}
