//! Cohort coordination: the all-items barrier and completion aggregation.
//!
//! A [`Cohort`] owns the sections built from one collection, either the
//! input of a run or the output of one flat-map expansion. It has no state
//! enum of its own; on every section transition it asks its
//! [`BarrierPolicy`] for the aggregate status and reacts:
//!
//! - **Settled** → aggregate every section's contribution in input order and
//!   fire the completion callback. Happens at most once.
//! - **Parked** → release the barrier by advancing every section. Terminal
//!   sections ignore the call; waiting ones resume.
//!
//! Evaluation is serialised per cohort. A notification arriving while an
//! evaluation is in progress (re-entrantly, or from another worker thread)
//! only marks the cohort dirty; the active evaluator then re-checks, so a
//! barrier is never released twice for the same wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, info_span, Span};

use crate::barrier::{BarrierMode, BarrierPolicy, CohortStatus};
use crate::stage::{Item, StageList};
use crate::{CohortId, Section, State};

/// Callback receiving a cohort's aggregate.
pub type Completion = Box<dyn FnOnce(Vec<Item>) + Send + 'static>;

#[derive(Default)]
struct Evaluation {
    active: bool,
    dirty: bool,
}

/// The set of sections that must jointly terminate before one aggregate is
/// produced.
pub struct Cohort {
    id: CohortId,
    depth: usize,
    mode: BarrierMode,
    stages: StageList,
    sections: Vec<Arc<Section>>,
    barrier: Box<dyn BarrierPolicy>,
    evaluation: Mutex<Evaluation>,
    finished: AtomicBool,
    on_complete: Mutex<Option<Completion>>,
    span: Span,
}

impl std::fmt::Debug for Cohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cohort")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("mode", &self.mode)
            .field("sections", &self.sections.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Cohort {
    /// Builds a cohort over `items`, every section starting at stage `start`.
    ///
    /// A root cohort starts at 0; a flat-map expansion starts just past the
    /// flat-map stage so the same pipeline continues rather than restarts.
    pub fn new(
        stages: StageList,
        items: Vec<Item>,
        start: usize,
        mode: BarrierMode,
        parent: &Span,
        depth: usize,
    ) -> Arc<Self> {
        let id = CohortId::new_random();
        let span = info_span!(parent: parent, "cohort", cohort_id = %id, depth, items = items.len());
        let barrier = mode.policy(items.len());

        Arc::new_cyclic(|owner| {
            let sections = items
                .into_iter()
                .enumerate()
                .map(|(position, item)| {
                    Arc::new(Section::new(
                        position,
                        item,
                        stages.clone(),
                        owner.clone(),
                        span.clone(),
                        start,
                    ))
                })
                .collect();

            Self {
                id,
                depth,
                mode,
                stages,
                sections,
                barrier,
                evaluation: Mutex::new(Evaluation::default()),
                finished: AtomicBool::new(false),
                on_complete: Mutex::new(None),
                span,
            }
        })
    }

    /// Identifier used in this cohort's span.
    pub fn id(&self) -> CohortId {
        self.id
    }

    /// The sections, in input order.
    pub fn sections(&self) -> &[Arc<Section>] {
        &self.sections
    }

    /// Returns `true` once the completion callback has fired.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stores the completion callback and advances every section once.
    ///
    /// An empty cohort is settled immediately.
    pub fn run(self: &Arc<Self>, on_complete: Option<Completion>) {
        *self.lock_completion() = on_complete;
        if self.sections.is_empty() {
            self.evaluate();
            return;
        }
        for section in &self.sections {
            section.advance();
        }
    }

    /// Records a transition without evaluating.
    pub(crate) fn record(&self, from: State, to: State) {
        self.barrier.record(from, to);
    }

    /// Notification from a section after its state field changed.
    pub(crate) fn on_state_change(self: &Arc<Self>, from: State, to: State) {
        self.barrier.record(from, to);
        self.evaluate();
    }

    /// Continues the remaining stages over `items` in a nested cohort whose
    /// aggregate becomes `section`'s contribution.
    pub(crate) fn expand(&self, section: &Arc<Section>, items: Vec<Item>) {
        let nested = Cohort::new(
            self.stages.clone(),
            items,
            section.cursor(),
            self.mode,
            &self.span,
            self.depth + 1,
        );
        debug!(
            section = section.position(),
            nested = %nested.id(),
            items = nested.sections().len(),
            "section expanded"
        );

        section.attach_expansion(Arc::clone(&nested));
        let parent = Arc::downgrade(section);
        nested.run(Some(Box::new(move |items| {
            if let Some(section) = parent.upgrade() {
                section.complete_expansion(items);
            }
        })));
    }

    fn evaluate(self: &Arc<Self>) {
        {
            let mut evaluation = self.lock_evaluation();
            if evaluation.active {
                evaluation.dirty = true;
                return;
            }
            evaluation.active = true;
        }

        loop {
            match self.barrier.status(&self.sections) {
                CohortStatus::Settled => self.signal_finished(),
                CohortStatus::Parked => self.release(),
                CohortStatus::Progressing => {}
            }

            let mut evaluation = self.lock_evaluation();
            if evaluation.dirty {
                evaluation.dirty = false;
                continue;
            }
            evaluation.active = false;
            break;
        }
    }

    fn release(self: &Arc<Self>) {
        debug!(parent: &self.span, "barrier released");
        for section in &self.sections {
            section.advance();
        }
    }

    fn signal_finished(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut aggregate = Vec::new();
        for section in &self.sections {
            section.drain_into(&mut aggregate);
        }

        let mut by_state = [0_usize; State::ALL.len()];
        for section in &self.sections {
            by_state[section.state().index()] += 1;
        }
        info!(
            parent: &self.span,
            aggregate = aggregate.len(),
            skipped = by_state[State::Skip.index()],
            failed = by_state[State::Error.index()],
            timed_out = by_state[State::Timeout.index()],
            "cohort finished"
        );

        let on_complete = self.lock_completion().take();
        if let Some(on_complete) = on_complete {
            on_complete(aggregate);
        }
    }

    fn lock_evaluation(&self) -> MutexGuard<'_, Evaluation> {
        self.evaluation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_completion(&self) -> MutexGuard<'_, Option<Completion>> {
        self.on_complete.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
