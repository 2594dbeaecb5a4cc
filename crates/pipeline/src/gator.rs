//! Slot/window admission control shared by every item passing a gate stage.
//!
//! A [`Gator`] admits at most `slots` actions at once. Capacity is refilled
//! only on window boundaries: at each tick the slots released are the
//! completions observed during that window. An action submitted while every
//! slot is taken therefore waits at least until the next tick, which produces
//! bursts of up to `slots` admissions per window rather than a sliding window
//! or a token bucket.
//!
//! ```text
//! slots = 3, window = 25ms, 5 actions submitted at t=0
//!
//! t=0   admit a0 a1 a2      queue [a3 a4]
//! t=25  tick: 3 released    admit a3 a4
//! t=50  tick: 2 released    queue empty, nothing running -> timer stops
//! ```
//!
//! `schedule` and the window tick share one admission routine, so the order
//! in which queued actions are admitted is always FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::GateConfig;

/// An action waiting for admission. Receives the [`Ready`] handle it must
/// release once its unit of work has resolved.
pub type GatedAction = Box<dyn FnOnce(Ready) + Send + 'static>;

// ---------------------------------------------------------------------------
// Ready handle
// ---------------------------------------------------------------------------

/// Completion handle passed to every admitted action.
///
/// Releasing it (explicitly via [`Ready::release`] or by dropping it) records
/// one completion in the current window. Ownership guarantees it is counted
/// exactly once.
#[derive(Debug)]
pub struct Ready {
    gator: Option<Arc<Gator>>,
}

impl Ready {
    fn attached(gator: Arc<Gator>) -> Self {
        Self { gator: Some(gator) }
    }

    fn detached() -> Self {
        Self { gator: None }
    }

    /// Marks the admitted action as complete.
    pub fn release(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(gator) = self.gator.take() {
            gator.complete();
        }
    }
}

impl Drop for Ready {
    fn drop(&mut self) {
        self.signal();
    }
}

// ---------------------------------------------------------------------------
// Gator
// ---------------------------------------------------------------------------

/// Point-in-time view of a [`Gator`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatorStats {
    /// Actions admitted and not yet accounted for by a window tick.
    pub running: u32,
    /// Completions observed in the current window.
    pub completed: u32,
    /// Actions waiting for a slot.
    pub queued: usize,
    /// Whether the window timer is active.
    pub timer_active: bool,
}

#[derive(Default)]
struct GatorState {
    running: u32,
    completed: u32,
    queue: VecDeque<GatedAction>,
    timer_active: bool,
}

impl GatorState {
    /// Pops queued actions into free slots, FIFO.
    fn admit(&mut self, slots: u32) -> Vec<GatedAction> {
        let mut admitted = Vec::new();
        while self.running < slots {
            let Some(action) = self.queue.pop_front() else {
                break;
            };
            self.running += 1;
            admitted.push(action);
        }
        admitted
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running == 0
    }
}

/// Admission-control scheduler for one gate stage.
pub struct Gator {
    config: GateConfig,
    state: Mutex<GatorState>,
}

impl std::fmt::Debug for Gator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Gator {
    /// Creates a scheduler for `config`. An unbounded configuration (zero
    /// slots or zero window) runs every action synchronously.
    pub fn new(config: GateConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(GatorState::default()),
        })
    }

    /// Returns the configuration this scheduler enforces.
    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Returns a snapshot of the internal counters.
    pub fn stats(&self) -> GatorStats {
        let state = self.lock();
        GatorStats {
            running: state.running,
            completed: state.completed,
            queued: state.queue.len(),
            timer_active: state.timer_active,
        }
    }

    /// Queues `action` and admits as many queued actions as there are free
    /// slots. Starts the window timer if it is not already running.
    ///
    /// Admitted actions run on the calling task, after the internal lock has
    /// been released. Must be called from within a Tokio runtime when the
    /// gate is bounded.
    pub fn schedule<F>(self: &Arc<Self>, action: F)
    where
        F: FnOnce(Ready) + Send + 'static,
    {
        if !self.config.is_bounded() {
            action(Ready::detached());
            return;
        }

        let (admitted, start_timer) = {
            let mut state = self.lock();
            state.queue.push_back(Box::new(action));
            let admitted = state.admit(self.config.slots);
            let start_timer = !state.timer_active;
            state.timer_active = true;
            trace!(
                admitted = admitted.len(),
                running = state.running,
                queued = state.queue.len(),
                "gate schedule"
            );
            (admitted, start_timer)
        };

        if start_timer {
            self.start_timer();
        }
        self.dispatch(admitted);
    }

    /// Window boundary: release the slots completed during the window and
    /// admit from the queue. Returns `false` once the timer should stop.
    fn tick(self: &Arc<Self>) -> bool {
        let (admitted, keep_running) = {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(state.completed);
            state.completed = 0;
            let admitted = state.admit(self.config.slots);
            let keep_running = !state.is_idle();
            if !keep_running {
                state.timer_active = false;
            }
            trace!(
                admitted = admitted.len(),
                running = state.running,
                queued = state.queue.len(),
                "gate window tick"
            );
            (admitted, keep_running)
        };

        self.dispatch(admitted);
        keep_running
    }

    fn start_timer(self: &Arc<Self>) {
        let gator = Arc::clone(self);
        let window = self.config.window();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + window, window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !gator.tick() {
                    break;
                }
            }
        });
    }

    fn dispatch(self: &Arc<Self>, admitted: Vec<GatedAction>) {
        for action in admitted {
            action(Ready::attached(Arc::clone(self)));
        }
    }

    fn complete(&self) {
        self.lock().completed += 1;
    }

    fn lock(&self) -> MutexGuard<'_, GatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    fn gate(slots: u32, window_ms: u64) -> Arc<Gator> {
        Gator::new(GateConfig::new(slots, Duration::from_millis(window_ms)))
    }

    #[tokio::test]
    async fn unbounded_runs_synchronously() {
        let gator = gate(0, 0);
        let result = Arc::new(Mutex::new(Vec::new()));
        let total = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let result = Arc::clone(&result);
            let total = Arc::clone(&total);
            gator.schedule(move |ready| {
                let mut result = result.lock().unwrap();
                let len = result.len() as u32;
                result.push(len);
                total.fetch_add(len + 1, Ordering::SeqCst);
                ready.release();
            });
        }

        // Nothing was deferred: the actions already ran.
        assert_eq!(total.load(Ordering::SeqCst), 6);
        assert_eq!(*result.lock().unwrap(), vec![0, 1, 2]);
        assert!(!gator.stats().timer_active);
    }

    #[tokio::test(start_paused = true)]
    async fn enough_slots_admits_everything_at_once() {
        let gator = gate(3, 20);
        let start = Instant::now();
        let admissions = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3_u32 {
            let admissions = Arc::clone(&admissions);
            gator.schedule(move |ready| {
                admissions.lock().unwrap().push((i, start.elapsed()));
                ready.release();
            });
        }

        let admissions = admissions.lock().unwrap().clone();
        assert_eq!(admissions.len(), 3);
        assert!(admissions.iter().all(|(_, at)| *at < Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_slots_wait_for_next_window() {
        let gator = gate(2, 20);
        let start = Instant::now();
        let admissions = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3_u32 {
            let admissions = Arc::clone(&admissions);
            gator.schedule(move |ready| {
                admissions.lock().unwrap().push((i, start.elapsed()));
                ready.release();
            });
        }
        assert_eq!(gator.stats().queued, 1);

        sleep(Duration::from_millis(25)).await;

        let admissions = admissions.lock().unwrap().clone();
        let order: Vec<u32> = admissions.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(admissions[2].1 >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_actions_hold_their_slot_across_a_tick() {
        let gator = gate(2, 10);
        let start = Instant::now();
        let admissions = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicU32::new(0));

        for i in 0..3_u32 {
            let admissions = Arc::clone(&admissions);
            let finished = Arc::clone(&finished);
            gator.schedule(move |ready| {
                admissions.lock().unwrap().push(start.elapsed());
                tokio::spawn(async move {
                    sleep(Duration::from_millis(11)).await;
                    finished.fetch_add(i + 1, Ordering::SeqCst);
                    ready.release();
                });
            });
        }

        sleep(Duration::from_millis(40)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 6);
        let admissions = admissions.lock().unwrap().clone();
        assert!(admissions[0] < Duration::from_millis(10));
        assert!(admissions[1] < Duration::from_millis(10));
        // The tick at 10ms saw no completions, so the third action waits for 20ms.
        assert!(admissions[2] >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_ready_counts_as_completion() {
        let gator = gate(1, 10);
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let ran = Arc::clone(&ran);
            gator.schedule(move |ready| {
                ran.fetch_add(1, Ordering::SeqCst);
                drop(ready);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(15)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_stops_once_idle() {
        let gator = gate(2, 10);
        gator.schedule(|ready| ready.release());
        assert!(gator.stats().timer_active);

        sleep(Duration::from_millis(35)).await;

        let stats = gator.stats();
        assert!(!stats.timer_active);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
    }
}
