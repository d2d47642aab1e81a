//! Alert dispatch.
//!
//! One triggered event fans out to every configured `AlertStep`. Steps are
//! grouped in lanes: lanes run at once on their own threads, steps inside a
//! lane run in order. A stalled messaging server cannot hold back snapshot
//! capture, while the popup still opens only after the new snapshot is on
//! disk.
//!
//! With a shutdown flag attached, the dispatcher stops waiting for running
//! steps once the flag is set. Abandoned steps keep running detached and
//! die with the process.

use anyhow::Result;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::RoomBinding;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// A single alert side effect.
pub trait AlertStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, binding: &RoomBinding) -> Result<()>;
}

/// Anything the cooldown gate can hand a triggered event to.
pub trait Dispatch {
    fn dispatch(&self, binding: &RoomBinding) -> DispatchReport;
}

impl<D: Dispatch + ?Sized> Dispatch for Box<D> {
    fn dispatch(&self, binding: &RoomBinding) -> DispatchReport {
        (**self).dispatch(binding)
    }
}

#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step: &'static str,
    /// Error text with its context chain on failure.
    pub result: std::result::Result<(), String>,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<StepOutcome>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(StepOutcome::succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step == step)
    }
}

type Lane = Vec<(usize, Arc<dyn AlertStep>)>;

#[derive(Default)]
pub struct AlertDispatcher {
    lanes: Vec<Lane>,
    step_count: usize,
    shutdown: Option<Arc<AtomicBool>>,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `step` in a lane of its own.
    pub fn with_step(mut self, step: impl AlertStep + 'static) -> Self {
        let entry = self.entry(step);
        self.lanes.push(vec![entry]);
        self
    }

    /// Add `step` to run after the most recently added lane finishes its
    /// steps, whatever their outcome.
    pub fn then_step(mut self, step: impl AlertStep + 'static) -> Self {
        let entry = self.entry(step);
        match self.lanes.last_mut() {
            Some(lane) => lane.push(entry),
            None => self.lanes.push(vec![entry]),
        }
        self
    }

    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> Vec<&'static str> {
        let mut names = vec![""; self.step_count];
        for (index, step) in self.lanes.iter().flatten() {
            names[*index] = step.name();
        }
        names
    }

    fn entry(&mut self, step: impl AlertStep + 'static) -> (usize, Arc<dyn AlertStep>) {
        let index = self.step_count;
        self.step_count += 1;
        (index, Arc::new(step))
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

fn run_lane(
    lane: Lane,
    binding: RoomBinding,
    shutdown: Option<Arc<AtomicBool>>,
    tx: Sender<(usize, StepOutcome)>,
) {
    for (index, step) in lane {
        if shutdown.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
            return;
        }
        let start = Instant::now();
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| step.run(&binding))) {
            Ok(result) => result.map_err(|e| format!("{:#}", e)),
            Err(_) => Err("alert step panicked".to_string()),
        };
        let outcome = StepOutcome {
            step: step.name(),
            result,
            elapsed: start.elapsed(),
        };
        if tx.send((index, outcome)).is_err() {
            return;
        }
    }
}

impl Dispatch for AlertDispatcher {
    fn dispatch(&self, binding: &RoomBinding) -> DispatchReport {
        let (tx, rx) = mpsc::channel();
        for lane in &self.lanes {
            let lane = lane.clone();
            let binding = binding.clone();
            let shutdown = self.shutdown.clone();
            let tx = tx.clone();
            std::thread::spawn(move || run_lane(lane, binding, shutdown, tx));
        }
        drop(tx);

        let mut slots: Vec<Option<StepOutcome>> = vec![None; self.step_count];
        loop {
            match rx.recv_timeout(WAIT_SLICE) {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_shutting_down() {
                        log::info!("shutdown requested, not waiting for running alert steps");
                        break;
                    }
                }
            }
        }

        let names = self.step_names();
        let outcomes: Vec<StepOutcome> = slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or(StepOutcome {
                    step: name,
                    result: Err("abandoned at shutdown".to_string()),
                    elapsed: Duration::ZERO,
                })
            })
            .collect();

        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => log::info!(
                    "alert step '{}' done in {}ms",
                    outcome.step,
                    outcome.elapsed.as_millis()
                ),
                Err(e) => log::warn!("alert step '{}' failed: {}", outcome.step, e),
            }
        }

        DispatchReport { outcomes }
    }
}
