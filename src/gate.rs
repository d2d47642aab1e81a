//! Cooldown gate between the tracker and alert dispatch.
//!
//! A triggered event is dispatched synchronously, then the gate blocks for
//! the cooldown interval. The caller is expected to drop and re-open its
//! feed session afterwards so detections queued during the pause are never
//! processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::{Dispatch, DispatchReport};
use crate::{MotionEvent, RoomBinding};

pub const DEFAULT_PAUSE: Duration = Duration::from_secs(30);
const PAUSE_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum GateDecision {
    /// Batch did not trigger.
    Idle,
    /// Batch triggered inside the cooldown window; nothing dispatched.
    Suppressed,
    /// Alerts were dispatched and the pause has been served.
    Fired(DispatchReport),
}

impl GateDecision {
    /// Whether the feed session must be discarded and re-established.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, GateDecision::Fired(_))
    }
}

pub struct CooldownGate<D> {
    dispatcher: D,
    binding: RoomBinding,
    pause: Duration,
    shutdown: Option<Arc<AtomicBool>>,
    last_fired: Option<Instant>,
}

impl<D: Dispatch> CooldownGate<D> {
    pub fn new(dispatcher: D, binding: RoomBinding, pause: Duration) -> Self {
        Self {
            dispatcher,
            binding,
            pause,
            shutdown: None,
            last_fired: None,
        }
    }

    /// Cut the pause short once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn binding(&self) -> &RoomBinding {
        &self.binding
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    pub fn handle_event(&mut self, event: MotionEvent) -> GateDecision {
        if !event.triggered {
            return GateDecision::Idle;
        }
        if let Some(at) = self.last_fired {
            let since = at.elapsed();
            if since < self.pause {
                log::debug!(
                    "motion inside cooldown window ({}ms left), not dispatching",
                    self.pause.saturating_sub(since).as_millis()
                );
                return GateDecision::Suppressed;
            }
        }

        log::info!(
            "motion detected in {} (sensor {}), dispatching alerts",
            self.binding.room_name,
            self.binding.sensor_id
        );
        let report = self.dispatcher.dispatch(&self.binding);
        if !report.all_succeeded() {
            log::warn!(
                "{} of {} alert steps failed",
                report.failures().count(),
                report.outcomes.len()
            );
        }
        self.last_fired = Some(Instant::now());

        log::info!("pausing detection for {}s", self.pause.as_secs());
        self.serve_pause();
        GateDecision::Fired(report)
    }

    fn serve_pause(&self) {
        let deadline = Instant::now() + self.pause;
        loop {
            if self.is_shutting_down() {
                log::debug!("cooldown pause interrupted by shutdown");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}
