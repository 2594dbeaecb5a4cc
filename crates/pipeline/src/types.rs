//! Shared value types for the cohort engine.
//!
//! Unlike the identifiers in [`crate::identifiers`], these types carry values
//! with invariants (a section state is exactly one of six variants, a gate is
//! either bounded or a pass-through) and participate in engine decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Section state
// ---------------------------------------------------------------------------

/// Progress of one item through the stage list.
///
/// Exactly one state is active at a time. [`State::Skip`], [`State::Error`],
/// [`State::Timeout`] and [`State::Finished`] are terminal: a section in any
/// of them never runs another stage. [`State::Wait`] is suspended but not
/// terminal; only a cohort-wide barrier release moves it back to
/// [`State::Running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// A stage is dispatched or about to be.
    Running,
    /// Parked on a barrier stage until every sibling has arrived or terminated.
    Wait,
    /// Excluded on purpose by a filter or an empty expansion.
    Skip,
    /// A stage callback failed, panicked, or received an item of the wrong type.
    Error,
    /// A stage deadline elapsed before the callback completed.
    Timeout,
    /// Every stage ran; the item contributes to the aggregate.
    Finished,
}

impl State {
    /// Every state, in declaration order. Indexes match [`State::index`].
    pub const ALL: [State; 6] = [
        State::Running,
        State::Wait,
        State::Skip,
        State::Error,
        State::Timeout,
        State::Finished,
    ];

    /// Returns `true` for states no stage will ever leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Skip | State::Error | State::Timeout | State::Finished
        )
    }

    /// Returns `true` if the section is not actively running a stage.
    pub fn is_parked(self) -> bool {
        self == State::Wait || self.is_terminal()
    }

    /// Returns `true` if a section in this state contributes its item to the
    /// aggregate. Only [`State::Finished`] does.
    pub fn contributes(self) -> bool {
        self == State::Finished
    }

    /// Position of this state in [`State::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Running => "running",
            State::Wait => "wait",
            State::Skip => "skip",
            State::Error => "error",
            State::Timeout => "timeout",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Gate configuration
// ---------------------------------------------------------------------------

/// Admission-control settings for one gate stage.
///
/// At most `slots` invocations are admitted per `window_ms`. A configuration
/// with zero slots or a zero window is a pass-through: every action runs
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum number of concurrently admitted invocations.
    pub slots: u32,
    /// Length of the refill window in milliseconds.
    pub window_ms: u64,
}

impl GateConfig {
    /// Creates a gate admitting `slots` invocations per `window`.
    pub fn new(slots: u32, window: Duration) -> Self {
        Self {
            slots,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the refill window.
    pub fn window(self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Returns `true` if this configuration throttles anything at all.
    pub fn is_bounded(self) -> bool {
        self.slots > 0 && self.window_ms > 0
    }
}

impl std::fmt::Display for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} slots / {}ms", self.slots, self.window_ms)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        let delta = (self.0 - earlier.0).num_milliseconds();
        u64::try_from(delta).unwrap_or(0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
