//! Cohort execution engine.
//!
//! Runs a declared sequence of asynchronous per-item operations (map, filter,
//! effect, flat-map) over a collection. Every item progresses concurrently
//! through its own state machine, yet the run produces one aggregate in input
//! order, supports per-stage deadlines, a manual all-items barrier, and an
//! admission-control gate shared by every item passing a stage.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`gator`] | Slot/window admission-control scheduler (`Gator`, `Ready`) |
//! | [`stage`] | Stage variants, typed constructors, deadline racing (`Stage`, `StageList`) |
//! | [`section`] | Per-item state machine (`Section`) |
//! | [`cohort`] | All-items barrier and aggregation (`Cohort`) |
//! | [`barrier`] | Cohort status policies (`BarrierPolicy`, `BarrierMode`) |
//! | [`pipeline`] | Run entry point (`Pipeline`) |
//! | [`config`] | Engine configuration (`EngineConfig`) |
//! | [`identifiers`] | Run and cohort identifiers |
//! | [`types`] | Shared value types (`State`, `GateConfig`, `Timestamp`) |
//! | [`errors`] | Per-item and run-level error types |
//!
//! ## Failure Model
//!
//! Best effort, partial results. A stage that fails, panics or misses its
//! deadline drops only its own item; siblings continue and the run still
//! completes. Deadlines never cancel user work: a late callback runs to the
//! end and its result is discarded.

pub mod barrier;
pub mod cohort;
pub mod config;
pub mod errors;
pub mod gator;
pub mod identifiers;
pub mod pipeline;
pub mod section;
pub mod stage;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use barrier::{BarrierMode, BarrierPolicy, CohortStatus, CountingBarrier, ScanBarrier};
pub use cohort::{Cohort, Completion};
pub use config::EngineConfig;
pub use errors::{BoxError, PipelineError, StageError};
pub use gator::{GatedAction, Gator, GatorStats, Ready};
pub use identifiers::{CohortId, RunId};
pub use pipeline::Pipeline;
pub use section::Section;
pub use stage::{Condition, Item, Outcome, Stage, StageFn, StageFuture, StageKind, StageList};
pub use types::{GateConfig, State, Timestamp};
