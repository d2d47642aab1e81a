//! Per-object motion tracking.
//!
//! The tracker remembers the last bounding box of every object id it has
//! seen and classifies each batch as motion or not. A batch triggers when
//! any one box edge of any previously seen object moved by at least the
//! sensitivity threshold. Edges are compared independently; there is no
//! combined distance metric.

use std::collections::HashMap;

use crate::{BoundingBox, DetectionRecord, MotionEvent, ObjectId};

pub const DEFAULT_SENSITIVITY: f64 = 0.05;

#[derive(Clone, Debug)]
struct TrackedObject {
    last_box: BoundingBox,
    last_seen_batch: u64,
}

/// Owns the tracked-object table. Must be fed batches in arrival order.
#[derive(Debug)]
pub struct ObjectTracker {
    sensitivity: f64,
    evict_after_batches: Option<u64>,
    objects: HashMap<ObjectId, TrackedObject>,
    batches_seen: u64,
}

impl ObjectTracker {
    /// Smaller sensitivity values trigger on smaller movements.
    pub fn new(sensitivity: f64) -> Self {
        Self {
            sensitivity,
            evict_after_batches: None,
            objects: HashMap::new(),
            batches_seen: 0,
        }
    }

    /// Drop objects not seen in the last `batches` observed batches.
    pub fn with_eviction(mut self, batches: Option<u64>) -> Self {
        self.evict_after_batches = batches;
        self
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    pub fn tracked_count(&self) -> usize {
        self.objects.len()
    }

    pub fn last_box(&self, id: &ObjectId) -> Option<BoundingBox> {
        self.objects.get(id).map(|obj| obj.last_box)
    }

    pub fn observe(&mut self, batch: &[DetectionRecord]) -> MotionEvent {
        self.batches_seen += 1;
        let batch_no = self.batches_seen;
        let mut triggered = false;

        for record in batch {
            match self.objects.get_mut(&record.object_id) {
                None => {
                    // First sighting only sets the baseline.
                    self.objects.insert(
                        record.object_id.clone(),
                        TrackedObject {
                            last_box: record.bounding_box,
                            last_seen_batch: batch_no,
                        },
                    );
                }
                Some(tracked) => {
                    let deltas = tracked.last_box.edge_deltas(&record.bounding_box);
                    tracked.last_box = record.bounding_box;
                    tracked.last_seen_batch = batch_no;
                    if deltas.iter().any(|d| *d >= self.sensitivity) {
                        log::debug!(
                            "object {} moved: deltas={:?} sensitivity={}",
                            record.object_id,
                            deltas,
                            self.sensitivity
                        );
                        triggered = true;
                    }
                }
            }
        }

        self.evict_stale(batch_no);
        MotionEvent { triggered }
    }

    fn evict_stale(&mut self, batch_no: u64) {
        let Some(limit) = self.evict_after_batches else {
            return;
        };
        let before = self.objects.len();
        self.objects
            .retain(|_, obj| batch_no.saturating_sub(obj.last_seen_batch) <= limit);
        let dropped = before - self.objects.len();
        if dropped > 0 {
            log::debug!("evicted {} stale tracked objects", dropped);
        }
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVITY)
    }
}
