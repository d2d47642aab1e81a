//! Presence Alert
//!
//! This crate watches one room through a camera sensor's object-detection
//! feed and raises an alert when a tracked person moves.
//!
//! # Pipeline
//!
//! 1. **Feed**: MQTT messages are decoded into batches of `DetectionRecord`s
//!    filtered to the object class of interest.
//! 2. **Tracker**: per-object bounding boxes are remembered across batches;
//!    a batch triggers when any box edge moved by at least the sensitivity.
//! 3. **Gate**: a trigger dispatches alerts, pauses the feed for the cooldown
//!    interval and asks the feed to reconnect so queued detections are dropped.
//! 4. **Dispatch**: snapshot capture then the local popup, alongside the
//!    XMPP message; every step reports its own outcome.
//!
//! # Module Structure
//!
//! - `config`: settings file, environment overrides, room mapping table
//! - `tracker`, `gate`, `dispatch`: the motion classification core
//! - `snapshot`, `popup`, `notify`: alert side effects
//! - `feed`, `transport`: MQTT ingestion

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod dispatch;
pub mod feed;
pub mod gate;
pub mod notify;
pub mod popup;
pub mod snapshot;
pub mod tracker;
pub mod transport;

pub use config::{AlertConfig, RoomTable};
pub use dispatch::{AlertDispatcher, AlertStep, Dispatch, DispatchReport, StepOutcome};
pub use feed::{decode_batch, FeedAction, Pipeline};
pub use gate::{CooldownGate, GateDecision};
pub use snapshot::{CaptureError, PollPolicy, SnapshotClient};
pub use tracker::ObjectTracker;

// -------------------- Detections --------------------

/// Sensor-assigned identifier of one physical object across messages.
///
/// The feed sends integers, but string ids are accepted too; both are kept
/// in their JSON text form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized box corners in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Absolute per-edge displacement, in `x0, y0, x1, y1` order.
    pub fn edge_deltas(&self, other: &BoundingBox) -> [f64; 4] {
        [
            (self.x0 - other.x0).abs(),
            (self.y0 - other.y0).abs(),
            (self.x1 - other.x1).abs(),
            (self.y1 - other.y1).abs(),
        ]
    }
}

/// One observed object in one feed message.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub object_id: ObjectId,
    pub object_class: String,
    pub bounding_box: BoundingBox,
}

impl DetectionRecord {
    pub fn new(
        object_id: impl Into<ObjectId>,
        object_class: &str,
        bounding_box: BoundingBox,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            object_class: object_class.to_string(),
            bounding_box,
        }
    }
}

/// Classification of one processed batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionEvent {
    pub triggered: bool,
}

impl MotionEvent {
    pub const IDLE: MotionEvent = MotionEvent { triggered: false };
    pub const TRIGGERED: MotionEvent = MotionEvent { triggered: true };
}

// -------------------- Room --------------------

/// The monitored room paired with its sensor. Fixed for the process lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomBinding {
    pub sensor_id: String,
    pub room_name: String,
    pub call_address: String,
}

impl RoomBinding {
    /// Text delivered to the remote party when motion is detected.
    pub fn alert_text(&self) -> String {
        format!(
            "Movement detected! Call room {}: SIP:{}",
            self.room_name, self.call_address
        )
    }
}

/// Escape text for XML character data and quoted attributes. Shared by the
/// XMPP stanzas and the popup page.
pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_xml_covers_markup_and_quotes() {
        assert_eq!(
            escape_xml(r#"Ward <3> & "B's""#),
            "Ward &lt;3&gt; &amp; &quot;B&apos;s&quot;"
        );
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn edge_deltas_are_absolute_per_edge() {
        let a = BoundingBox::new(0.10, 0.10, 0.20, 0.20);
        let b = BoundingBox::new(0.05, 0.12, 0.27, 0.20);
        let d = a.edge_deltas(&b);
        assert!((d[0] - 0.05).abs() < 1e-9);
        assert!((d[1] - 0.02).abs() < 1e-9);
        assert!((d[2] - 0.07).abs() < 1e-9);
        assert_eq!(d[3], 0.0);
    }

    #[test]
    fn alert_text_names_room_and_address() {
        let binding = RoomBinding {
            sensor_id: "Q2GV-ABCD".to_string(),
            room_name: "Room 101".to_string(),
            call_address: "room101@example.com".to_string(),
        };
        assert_eq!(
            binding.alert_text(),
            "Movement detected! Call room Room 101: SIP:room101@example.com"
        );
    }

    #[test]
    fn object_id_from_number_and_text() {
        assert_eq!(ObjectId::from(7u64), ObjectId::from("7"));
        assert_eq!(ObjectId::new("abc").to_string(), "abc");
    }
}
