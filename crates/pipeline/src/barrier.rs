//! Cohort status computation.
//!
//! A cohort's status is derived purely from the states of its sections:
//!
//! | Status | Condition | Cohort reaction |
//! |--------|-----------|-----------------|
//! | [`CohortStatus::Settled`] | every section terminal | aggregate and fire the completion callback |
//! | [`CohortStatus::Parked`] | no section running, at least one waiting | release the barrier |
//! | [`CohortStatus::Progressing`] | some section running | nothing |
//!
//! [`ScanBarrier`] re-reads every section on each notification (O(n) per
//! notification). [`CountingBarrier`] keeps counts by state and answers in
//! O(1). Both produce the same statuses for the same transition history.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{Section, State};

/// Aggregate status of a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CohortStatus {
    /// Every section is terminal.
    Settled,
    /// No section is running and at least one is waiting on a barrier.
    Parked,
    /// At least one section is running a stage.
    Progressing,
}

/// Strategy for computing a cohort's status.
pub trait BarrierPolicy: Send + Sync {
    /// Observes one section transition.
    fn record(&self, from: State, to: State);

    /// Computes the current status.
    fn status(&self, sections: &[Arc<Section>]) -> CohortStatus;
}

/// Which [`BarrierPolicy`] a cohort uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierMode {
    /// Recompute from the sections on every notification.
    #[default]
    Scan,
    /// Track counts by state incrementally.
    Counting,
}

impl BarrierMode {
    /// Builds the policy for a cohort of `len` sections, all initially running.
    pub fn policy(self, len: usize) -> Box<dyn BarrierPolicy> {
        match self {
            BarrierMode::Scan => Box::new(ScanBarrier),
            BarrierMode::Counting => Box::new(CountingBarrier::new(len)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Recomputes the status from scratch.
#[derive(Debug, Default)]
pub struct ScanBarrier;

impl BarrierPolicy for ScanBarrier {
    fn record(&self, _from: State, _to: State) {}

    fn status(&self, sections: &[Arc<Section>]) -> CohortStatus {
        let states: Vec<State> = sections.iter().map(|s| s.state()).collect();
        classify(states.iter().copied())
    }
}

fn classify(states: impl Iterator<Item = State> + Clone) -> CohortStatus {
    if states.clone().all(State::is_terminal) {
        CohortStatus::Settled
    } else if states.into_iter().all(State::is_parked) {
        CohortStatus::Parked
    } else {
        CohortStatus::Progressing
    }
}

// ---------------------------------------------------------------------------

/// Tracks how many sections are in each state.
#[derive(Debug)]
pub struct CountingBarrier {
    counts: Mutex<[usize; State::ALL.len()]>,
}

impl CountingBarrier {
    /// Creates a tracker for `len` sections in [`State::Running`].
    pub fn new(len: usize) -> Self {
        let mut counts = [0; State::ALL.len()];
        counts[State::Running.index()] = len;
        Self {
            counts: Mutex::new(counts),
        }
    }
}

impl BarrierPolicy for CountingBarrier {
    fn record(&self, from: State, to: State) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts[from.index()] = counts[from.index()].saturating_sub(1);
        counts[to.index()] += 1;
    }

    fn status(&self, _sections: &[Arc<Section>]) -> CohortStatus {
        let counts = *self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if counts[State::Running.index()] > 0 {
            CohortStatus::Progressing
        } else if counts[State::Wait.index()] > 0 {
            CohortStatus::Parked
        } else {
            CohortStatus::Settled
        }
    }
}
